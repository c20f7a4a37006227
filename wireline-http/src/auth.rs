//! Basic and Digest authentication: challenge parsing, strongest-scheme
//! selection, and `Authorization` header construction (RFC 2617, MD5,
//! qop=auth).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec;
use crate::md5;

/// Username and password for basic & digest authentication.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Scheme {
    Basic,
    Digest,
}

#[derive(Debug, Clone)]
pub(crate) struct Challenge {
    pub scheme: Scheme,
    params: HashMap<String, String>,
}

impl Challenge {
    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Parse one `WWW-Authenticate` / `Proxy-Authenticate` value into a
/// challenge. Unknown schemes yield `None`.
pub(crate) fn parse_challenge(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme_text, rest) = match value.find(char::is_whitespace) {
        Some(space) => (&value[..space], value[space..].trim_start()),
        None => (value, ""),
    };
    let scheme = if scheme_text.eq_ignore_ascii_case("basic") {
        Scheme::Basic
    } else if scheme_text.eq_ignore_ascii_case("digest") {
        Scheme::Digest
    } else {
        return None;
    };
    Some(Challenge {
        scheme,
        params: parse_params(rest),
    })
}

/// Pick the strongest challenge on offer: Digest over Basic.
pub(crate) fn pick(challenges: &[Challenge]) -> Option<&Challenge> {
    challenges.iter().max_by_key(|c| c.scheme)
}

/// Build the `Authorization` (or `Proxy-Authorization`) value answering
/// `challenge` for the given request method token and target.
pub(crate) fn authorization(
    challenge: &Challenge,
    credentials: &Credentials,
    method: &str,
    target: &str,
) -> String {
    match challenge.scheme {
        Scheme::Basic => {
            let pair = format!("{}:{}", credentials.username, credentials.password);
            format!("Basic {}", codec::base64_encode(pair.as_bytes()))
        }
        Scheme::Digest => digest_authorization(challenge, credentials, method, target),
    }
}

fn digest_authorization(
    challenge: &Challenge,
    credentials: &Credentials,
    method: &str,
    target: &str,
) -> String {
    let realm = challenge.param("realm").unwrap_or("");
    let nonce = challenge.param("nonce").unwrap_or("");
    let opaque = challenge.param("opaque");
    let qop_offered = challenge
        .param("qop")
        .map(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
        .unwrap_or(false);

    let ha1 = md5::hex_digest(
        format!("{}:{realm}:{}", credentials.username, credentials.password).as_bytes(),
    );
    let ha2 = md5::hex_digest(format!("{method}:{target}").as_bytes());

    let mut out = format!(
        "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{target}\"",
        credentials.username
    );

    if qop_offered {
        let cnonce = make_cnonce(nonce);
        let nc = "00000001";
        let response =
            md5::hex_digest(format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}").as_bytes());
        out.push_str(&format!(
            ", qop=auth, nc={nc}, cnonce=\"{cnonce}\", response=\"{response}\""
        ));
    } else {
        let response = md5::hex_digest(format!("{ha1}:{nonce}:{ha2}").as_bytes());
        out.push_str(&format!(", response=\"{response}\""));
    }

    if let Some(opaque) = opaque {
        out.push_str(&format!(", opaque=\"{opaque}\""));
    }
    out.push_str(", algorithm=MD5");
    out
}

/// A per-attempt client nonce. Uniqueness matters, secrecy does not.
fn make_cnonce(server_nonce: &str) -> String {
    let mut hasher = DefaultHasher::new();
    server_nonce.hash(&mut hasher);
    if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
        now.subsec_nanos().hash(&mut hasher);
        now.as_secs().hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Parse `key=value, key="quoted value"` challenge parameters.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        // Skip separators.
        while i < bytes.len() && (bytes[i] == b',' || bytes[i].is_ascii_whitespace()) {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            continue; // bare token without value
        }
        let key = input[key_start..i].trim().to_ascii_lowercase();
        i += 1;

        let value = if bytes.get(i) == Some(&b'"') {
            i += 1;
            let value_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let value = input[value_start..i].to_string();
            i += 1; // closing quote
            value
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            input[value_start..i].trim().to_string()
        };

        if !key.is_empty() {
            params.insert(key, value);
        }
    }
    params
}
