use std::fmt;

/// HTTP request methods supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    /// DELETE. Sent with a request-line token of `DELETE`, never tunneled
    /// through another verb.
    Del,
}

impl Method {
    /// The request-line token for this method.
    pub fn token(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Del => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_uses_its_own_token() {
        assert_eq!(Method::Del.token(), "DELETE");
    }

    #[test]
    fn display_matches_token() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(Method::Head.to_string(), "HEAD");
    }
}
