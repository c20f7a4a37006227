//! RFC 3986 URI value type, strict parser, builder, and canonical
//! serializer.
//!
//! Path components and query keys/values are stored percent-decoded, so
//! equality compares the decoded model; serialization re-encodes them with
//! the unreserved set (`[A-Za-z0-9._~-]`, uppercase hex). The host is never
//! escaped, and bracketed IP literals round-trip with their brackets.

use std::fmt;

use crate::codec;
use crate::error::Error;
use crate::here;

/// The host subcomponent of an authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// A registered name (stored as received).
    Name(String),
    /// A dotted-decimal IPv4 literal.
    Ipv4(String),
    /// A bracketed IPv6 or IPvFuture literal; the inner text, no brackets.
    IpLiteral(String),
}

impl Host {
    /// The host text without brackets, suitable for DNS lookup or SNI.
    pub fn text(&self) -> &str {
        match self {
            Host::Name(s) | Host::Ipv4(s) | Host::IpLiteral(s) => s,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Name(s) | Host::Ipv4(s) => f.write_str(s),
            Host::IpLiteral(s) => write!(f, "[{s}]"),
        }
    }
}

/// The authority component: `(userinfo "@")? host (":" port)?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub userinfo: Option<String>,
    pub host: Host,
    pub port: Option<u16>,
}

/// An RFC 3986 URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    /// Lowercased at parse time.
    pub scheme: Option<String>,
    pub authority: Option<Authority>,
    /// Ordered path components, percent-decoded.
    pub path: Vec<String>,
    /// Ordered query pairs, percent-decoded. A key without `=` carries no
    /// value and re-emits without one.
    pub query: Vec<(String, Option<String>)>,
    /// Fragment, percent-decoded.
    pub fragment: Option<String>,
}

impl Uri {
    /// Parse a strict RFC 3986 URI (or relative reference).
    pub fn from_string(input: &str) -> Result<Uri, Error> {
        Parser::new(input).parse()
    }

    /// Start a builder from a base such as `"http://example.org"`.
    pub fn with_base(base: &str) -> Result<UriBuilder, Error> {
        Ok(UriBuilder {
            uri: Uri::from_string(base)?,
        })
    }

    /// The host text, if an authority is present.
    pub fn host_str(&self) -> Option<&str> {
        self.authority.as_ref().map(|a| a.host.text())
    }

    /// Explicit port, or the scheme default (80/443).
    pub fn port_or_default(&self) -> u16 {
        if let Some(port) = self.authority.as_ref().and_then(|a| a.port) {
            return port;
        }
        if self.is_https() {
            443
        } else {
            80
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme.as_deref() == Some("https")
    }

    /// The origin-form request target for the request line: the encoded
    /// path (at least `/`) plus the encoded query.
    pub fn request_target(&self) -> String {
        let mut out = String::new();
        for component in &self.path {
            out.push('/');
            out.push_str(&codec::url_escape(component.as_bytes()));
        }
        if out.is_empty() {
            out.push('/');
        }
        if !self.query.is_empty() {
            out.push('?');
            append_query(&mut out, &self.query);
        }
        out
    }
}

fn append_query(out: &mut String, query: &[(String, Option<String>)]) {
    for (i, (key, value)) in query.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&codec::url_escape(key.as_bytes()));
        if let Some(value) = value {
            out.push('=');
            out.push_str(&codec::url_escape(value.as_bytes()));
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{scheme}://")?;
        }
        if let Some(authority) = &self.authority {
            if let Some(userinfo) = &authority.userinfo {
                write!(f, "{userinfo}@")?;
            }
            write!(f, "{}", authority.host)?;
            if let Some(port) = authority.port {
                write!(f, ":{port}")?;
            }
        }
        for component in &self.path {
            write!(f, "/{}", codec::url_escape(component.as_bytes()))?;
        }
        if !self.query.is_empty() {
            let mut q = String::new();
            append_query(&mut q, &self.query);
            write!(f, "?{q}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{}", codec::url_escape(fragment.as_bytes()))?;
        }
        Ok(())
    }
}

/// Builder for a [`Uri`] from a base plus path components and query pairs.
pub struct UriBuilder {
    uri: Uri,
}

impl UriBuilder {
    /// Append one decoded path component.
    pub fn path_component(mut self, component: impl Into<String>) -> Self {
        self.uri.path.push(component.into());
        self
    }

    /// Append one decoded query pair.
    pub fn query_pair(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.uri.query.push((key.into(), Some(value.into())));
        self
    }

    pub fn build(self) -> Uri {
        self.uri
    }
}

// ── Parser ──────────────────────────────────────────────────────────

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedUri {
        reason: reason.into(),
        location: here!(),
    }
}

fn is_sub_delim(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
    )
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn is_pchar_raw(b: u8) -> bool {
    // pchar minus pct-encoded, which is validated separately.
    is_unreserved(b) || is_sub_delim(b) || b == b':' || b == b'@'
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Parser<'a> {
        Parser {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Uri, Error> {
        let scheme = self.parse_scheme()?;
        let authority = if self.eat_prefix(b"//") {
            Some(self.parse_authority()?)
        } else {
            None
        };
        let path = self.parse_path()?;
        let query = if self.eat(b'?') {
            self.parse_query()?
        } else {
            Vec::new()
        };
        let fragment = if self.eat(b'#') {
            Some(self.parse_fragment()?)
        } else {
            None
        };
        if self.pos != self.bytes.len() {
            return Err(malformed(format!(
                "trailing input at byte {}",
                self.pos
            )));
        }
        Ok(Uri {
            scheme,
            authority,
            path,
            query,
            fragment,
        })
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.rest().first() == Some(&b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_prefix(&mut self, prefix: &[u8]) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// `scheme ":"`: first char alpha, rest `[A-Za-z0-9+.-]`. Absent for
    /// relative references.
    fn parse_scheme(&mut self) -> Result<Option<String>, Error> {
        let rest = self.rest();
        let mut end = 0;
        while end < rest.len() {
            let b = rest[end];
            if b == b':' {
                break;
            }
            if matches!(b, b'/' | b'?' | b'#') {
                return Ok(None);
            }
            end += 1;
        }
        if end >= rest.len() || rest[end] != b':' || end == 0 {
            return Ok(None);
        }
        if !rest[0].is_ascii_alphabetic() {
            return Err(malformed("scheme must start with a letter"));
        }
        for &b in &rest[1..end] {
            if !(b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.')) {
                return Err(malformed(format!("invalid scheme byte 0x{b:02X}")));
            }
        }
        let scheme = std::str::from_utf8(&rest[..end])
            .expect("scheme bytes are ascii")
            .to_ascii_lowercase();
        self.pos += end + 1;
        Ok(Some(scheme))
    }

    fn parse_authority(&mut self) -> Result<Authority, Error> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|b| matches!(b, b'/' | b'?' | b'#'))
            .unwrap_or(rest.len());
        let text = &rest[..end];
        self.pos += end;

        // userinfo cannot contain '@', so split at the first one.
        let (userinfo, host_port) = match text.iter().position(|&b| b == b'@') {
            Some(at) => {
                let ui = &text[..at];
                for &b in ui {
                    if !(is_unreserved(b) || is_sub_delim(b) || b == b':' || b == b'%') {
                        return Err(malformed(format!("invalid userinfo byte 0x{b:02X}")));
                    }
                }
                validate_pct(ui)?;
                (
                    Some(String::from_utf8_lossy(ui).into_owned()),
                    &text[at + 1..],
                )
            }
            None => (None, text),
        };

        let (host, port_text) = if host_port.first() == Some(&b'[') {
            let close = host_port
                .iter()
                .position(|&b| b == b']')
                .ok_or_else(|| malformed("unterminated IP literal"))?;
            let inner = &host_port[1..close];
            let host = parse_ip_literal(inner)?;
            let after = &host_port[close + 1..];
            match after.first() {
                None => (host, None),
                Some(&b':') => (host, Some(&after[1..])),
                Some(_) => return Err(malformed("junk after IP literal")),
            }
        } else {
            let (host_text, port_text) = match host_port.iter().position(|&b| b == b':') {
                Some(colon) => (&host_port[..colon], Some(&host_port[colon + 1..])),
                None => (host_port, None),
            };
            for &b in host_text {
                if !(is_unreserved(b) || is_sub_delim(b) || b == b'%') {
                    return Err(malformed(format!("invalid host byte 0x{b:02X}")));
                }
            }
            validate_pct(host_text)?;
            let text = String::from_utf8_lossy(host_text).into_owned();
            let host = if is_ipv4(host_text) {
                Host::Ipv4(text)
            } else {
                Host::Name(text)
            };
            (host, port_text)
        };

        let port = match port_text {
            None => None,
            Some([]) => None, // "host:" carries an empty, syntactically valid port
            Some(digits) => {
                let text = std::str::from_utf8(digits).map_err(|_| malformed("bad port"))?;
                if !text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed("port must be decimal digits"));
                }
                Some(
                    text.parse::<u16>()
                        .map_err(|_| malformed("port out of range"))?,
                )
            }
        };

        Ok(Authority {
            userinfo,
            host,
            port,
        })
    }

    fn parse_path(&mut self) -> Result<Vec<String>, Error> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|b| matches!(b, b'?' | b'#'))
            .unwrap_or(rest.len());
        let text = &rest[..end];
        self.pos += end;

        if text.is_empty() {
            return Ok(Vec::new());
        }

        // Following an authority the text always starts with '/', because
        // authority parsing stops at '/', '?', or '#'. Rootless paths only
        // occur in relative references and are accepted as-is.
        let body = text.strip_prefix(b"/").unwrap_or(text);
        if body.is_empty() {
            // A bare "/" is the empty path (no components).
            return Ok(Vec::new());
        }
        body.split(|&b| b == b'/')
            .map(|segment| decode_component(segment, "path component"))
            .collect()
    }

    fn parse_query(&mut self) -> Result<Vec<(String, Option<String>)>, Error> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|&b| b == b'#')
            .unwrap_or(rest.len());
        let text = &rest[..end];
        self.pos += end;

        for &b in text {
            if !(is_pchar_raw(b) || matches!(b, b'/' | b'?' | b'%')) {
                return Err(malformed(format!("invalid query byte 0x{b:02X}")));
            }
        }

        if text.is_empty() {
            return Ok(Vec::new());
        }

        text.split(|&b| b == b'&')
            .map(|pair| match pair.iter().position(|&b| b == b'=') {
                Some(eq) => Ok((
                    decode_component(&pair[..eq], "query key")?,
                    Some(decode_component(&pair[eq + 1..], "query value")?),
                )),
                None => Ok((decode_component(pair, "query key")?, None)),
            })
            .collect()
    }

    fn parse_fragment(&mut self) -> Result<String, Error> {
        let rest = self.rest();
        for &b in rest {
            if !(is_pchar_raw(b) || matches!(b, b'/' | b'?' | b'%')) {
                return Err(malformed(format!("invalid fragment byte 0x{b:02X}")));
            }
        }
        self.pos = self.bytes.len();
        decode_component(rest, "fragment")
    }
}

/// Validate every `%` introduces two hex digits.
fn validate_pct(bytes: &[u8]) -> Result<(), Error> {
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let ok = bytes.get(i + 1).is_some_and(|b| b.is_ascii_hexdigit())
                && bytes.get(i + 2).is_some_and(|b| b.is_ascii_hexdigit());
            if !ok {
                return Err(malformed("truncated percent escape"));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Validate charset and percent escapes, then decode.
fn decode_component(bytes: &[u8], what: &str) -> Result<String, Error> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let hi = bytes
                .get(i + 1)
                .and_then(|b| (*b as char).to_digit(16))
                .ok_or_else(|| malformed(format!("truncated percent escape in {what}")))?;
            let lo = bytes
                .get(i + 2)
                .and_then(|b| (*b as char).to_digit(16))
                .ok_or_else(|| malformed(format!("truncated percent escape in {what}")))?;
            out.push((hi as u8) << 4 | lo as u8);
            i += 3;
        } else if is_pchar_raw(b) || matches!(b, b'/' | b'?') {
            out.push(b);
            i += 1;
        } else {
            return Err(malformed(format!("invalid byte 0x{b:02X} in {what}")));
        }
    }
    String::from_utf8(out).map_err(|_| malformed(format!("{what} is not valid utf-8")))
}

fn is_ipv4(bytes: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return false;
    };
    let octets: Vec<&str> = text.split('.').collect();
    octets.len() == 4
        && octets.iter().all(|octet| {
            !octet.is_empty()
                && octet.len() <= 3
                && octet.bytes().all(|b| b.is_ascii_digit())
                && octet.parse::<u16>().is_ok_and(|v| v <= 255)
                && (octet.len() == 1 || !octet.starts_with('0'))
        })
}

fn parse_ip_literal(inner: &[u8]) -> Result<Host, Error> {
    if inner.is_empty() {
        return Err(malformed("empty IP literal"));
    }
    if inner[0] == b'v' || inner[0] == b'V' {
        // IPvFuture: "v" 1*HEXDIG "." 1*(unreserved / sub-delims / ":")
        let dot = inner
            .iter()
            .position(|&b| b == b'.')
            .ok_or_else(|| malformed("IPvFuture missing '.'"))?;
        if dot < 2 || !inner[1..dot].iter().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed("bad IPvFuture version"));
        }
        if inner[dot + 1..].is_empty()
            || !inner[dot + 1..]
                .iter()
                .all(|&b| is_unreserved(b) || is_sub_delim(b) || b == b':')
        {
            return Err(malformed("bad IPvFuture body"));
        }
    } else if !inner
        .iter()
        .all(|&b| b.is_ascii_hexdigit() || matches!(b, b':' | b'.'))
        || !inner.contains(&b':')
    {
        return Err(malformed("bad IPv6 literal"));
    }
    Ok(Host::IpLiteral(
        std::str::from_utf8(inner)
            .expect("validated ascii")
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = Uri::from_string("http://user@example.org:8080/a/b?k=v#frag").unwrap();
        assert_eq!(uri.scheme.as_deref(), Some("http"));
        let authority = uri.authority.as_ref().unwrap();
        assert_eq!(authority.userinfo.as_deref(), Some("user"));
        assert_eq!(authority.host, Host::Name("example.org".into()));
        assert_eq!(authority.port, Some(8080));
        assert_eq!(uri.path, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(uri.query, vec![("k".to_string(), Some("v".to_string()))]);
        assert_eq!(uri.fragment.as_deref(), Some("frag"));
    }

    #[test]
    fn scheme_is_lowercased() {
        let uri = Uri::from_string("HTTP://Example.org").unwrap();
        assert_eq!(uri.scheme.as_deref(), Some("http"));
    }

    #[test]
    fn empty_path_has_no_components() {
        let uri = Uri::from_string("http://example.org").unwrap();
        assert!(uri.path.is_empty());
        assert_eq!(uri.to_string(), "http://example.org");

        let uri = Uri::from_string("http://example.org/").unwrap();
        assert!(uri.path.is_empty());
    }

    #[test]
    fn path_components_are_decoded() {
        let uri = Uri::from_string("http://h/a%20b/c").unwrap();
        assert_eq!(uri.path, vec!["a b".to_string(), "c".to_string()]);
        assert_eq!(uri.to_string(), "http://h/a%20b/c");
    }

    #[test]
    fn query_pairs_decode_and_valueless_keys_survive() {
        let uri = Uri::from_string("http://h/p?a=1&flag&b=two%20words").unwrap();
        assert_eq!(
            uri.query,
            vec![
                ("a".to_string(), Some("1".to_string())),
                ("flag".to_string(), None),
                ("b".to_string(), Some("two words".to_string())),
            ]
        );
        assert_eq!(uri.to_string(), "http://h/p?a=1&flag&b=two%20words");
    }

    #[test]
    fn ipv4_and_ipv6_hosts() {
        let uri = Uri::from_string("http://127.0.0.1:8080/x").unwrap();
        assert_eq!(
            uri.authority.as_ref().unwrap().host,
            Host::Ipv4("127.0.0.1".into())
        );

        let uri = Uri::from_string("http://[2001:db8::1]:443/x").unwrap();
        assert_eq!(
            uri.authority.as_ref().unwrap().host,
            Host::IpLiteral("2001:db8::1".into())
        );
        // Brackets come back on output.
        assert_eq!(uri.to_string(), "http://[2001:db8::1]:443/x");
    }

    #[test]
    fn port_zero_round_trips() {
        let uri = Uri::from_string("http://h:0/p").unwrap();
        assert_eq!(uri.authority.as_ref().unwrap().port, Some(0));
        assert_eq!(uri.to_string(), "http://h:0/p");
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        for input in [
            "1http://h",          // scheme starts with a digit
            "http://h:70000",     // port out of range
            "http://h:-1",        // negative port
            "http://[::1/p",      // unterminated literal
            "http://h/%2",        // truncated escape
            "http://h/a b",       // raw space
            "http://ex ample._com.com/path!!|",
        ] {
            assert!(
                Uri::from_string(input).is_err(),
                "expected failure for {input:?}"
            );
        }
    }

    #[test]
    fn builder_vector() {
        let uri = Uri::with_base("http://banana.fruit")
            .unwrap()
            .path_component("my")
            .path_component("endpoint")
            .query_pair("hello there", "good bye")
            .query_pair("happy", "sad")
            .build();
        assert_eq!(
            uri.to_string(),
            "http://banana.fruit/my/endpoint?hello%20there=good%20bye&happy=sad"
        );
    }

    #[test]
    fn builder_round_trips_through_parser() {
        let built = Uri::with_base("http://example.org")
            .unwrap()
            .path_component("söme path")
            .query_pair("key one", "value/one")
            .build();
        let reparsed = Uri::from_string(&built.to_string()).unwrap();
        assert_eq!(reparsed, built);
    }

    #[test]
    fn request_target_defaults_to_slash() {
        let uri = Uri::from_string("http://h").unwrap();
        assert_eq!(uri.request_target(), "/");

        let uri = Uri::from_string("http://h/a/b?x=1").unwrap();
        assert_eq!(uri.request_target(), "/a/b?x=1");
    }

    #[test]
    fn default_ports_follow_scheme() {
        assert_eq!(Uri::from_string("http://h").unwrap().port_or_default(), 80);
        assert_eq!(
            Uri::from_string("https://h").unwrap().port_or_default(),
            443
        );
        assert_eq!(
            Uri::from_string("https://h:8443").unwrap().port_or_default(),
            8443
        );
    }
}
