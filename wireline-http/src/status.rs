use std::fmt;

/// HTTP response status codes (the RFC 7231 subset 100–505).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Continue = 100,
    SwitchingProtocols = 101,

    Ok = 200,
    Created = 201,
    Accepted = 202,
    NonAuthorativeInfo = 203,
    NoContent = 204,
    ResetContent = 205,
    PartialContent = 206,

    MultipleChoices = 300,
    MovedPermanently = 301,
    Found = 302,
    SeeOther = 303,
    NotModified = 304,
    UseProxy = 305,
    TemporaryRedirect = 307,

    BadRequest = 400,
    Unauthorized = 401,
    PaymentRequired = 402,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    NotAcceptable = 406,
    ProxyAuthRequired = 407,
    RequestTimeout = 408,
    Conflict = 409,
    Gone = 410,
    LengthRequired = 411,
    PreconditionFailed = 412,
    RequestEntityTooLarge = 413,
    RequestUriTooLong = 414,
    UnsupportedMediaType = 415,
    RequestedRangeNotSatisfiable = 416,
    ExpectationFailed = 417,
    Teapot = 418,

    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    HttpVersionNotSupported = 505,
}

impl Status {
    /// The numeric status code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Map a numeric code onto the enumeration. Unknown codes yield `None`.
    pub fn from_code(code: u16) -> Option<Status> {
        use Status::*;
        let status = match code {
            100 => Continue,
            101 => SwitchingProtocols,
            200 => Ok,
            201 => Created,
            202 => Accepted,
            203 => NonAuthorativeInfo,
            204 => NoContent,
            205 => ResetContent,
            206 => PartialContent,
            300 => MultipleChoices,
            301 => MovedPermanently,
            302 => Found,
            303 => SeeOther,
            304 => NotModified,
            305 => UseProxy,
            307 => TemporaryRedirect,
            400 => BadRequest,
            401 => Unauthorized,
            402 => PaymentRequired,
            403 => Forbidden,
            404 => NotFound,
            405 => MethodNotAllowed,
            406 => NotAcceptable,
            407 => ProxyAuthRequired,
            408 => RequestTimeout,
            409 => Conflict,
            410 => Gone,
            411 => LengthRequired,
            412 => PreconditionFailed,
            413 => RequestEntityTooLarge,
            414 => RequestUriTooLong,
            415 => UnsupportedMediaType,
            416 => RequestedRangeNotSatisfiable,
            417 => ExpectationFailed,
            418 => Teapot,
            500 => InternalServerError,
            501 => NotImplemented,
            502 => BadGateway,
            503 => ServiceUnavailable,
            504 => GatewayTimeout,
            505 => HttpVersionNotSupported,
            _ => return None,
        };
        Some(status)
    }

    fn name(self) -> &'static str {
        use Status::*;
        match self {
            Continue => "continue",
            SwitchingProtocols => "switching_protocols",
            Ok => "ok",
            Created => "created",
            Accepted => "accepted",
            NonAuthorativeInfo => "non_authorative_info",
            NoContent => "no_content",
            ResetContent => "reset_content",
            PartialContent => "partial_content",
            MultipleChoices => "multiple_choices",
            MovedPermanently => "moved_permanently",
            Found => "found",
            SeeOther => "see_other",
            NotModified => "not_modified",
            UseProxy => "use_proxy",
            TemporaryRedirect => "temporary_redirect",
            BadRequest => "bad_request",
            Unauthorized => "unauthorized",
            PaymentRequired => "payment_required",
            Forbidden => "forbidden",
            NotFound => "not_found",
            MethodNotAllowed => "method_not_allowed",
            NotAcceptable => "not_acceptable",
            ProxyAuthRequired => "proxy_auth_required",
            RequestTimeout => "request_timeout",
            Conflict => "conflict",
            Gone => "gone",
            LengthRequired => "length_required",
            PreconditionFailed => "precondition_failed",
            RequestEntityTooLarge => "request_entity_too_large",
            RequestUriTooLong => "request_uri_too_long",
            UnsupportedMediaType => "unsupported_media_type",
            RequestedRangeNotSatisfiable => "requested_range_not_satisfiable",
            ExpectationFailed => "expectation_failed",
            Teapot => "teapot",
            InternalServerError => "internal_server_error",
            NotImplemented => "not_implemented",
            BadGateway => "bad_gateway",
            ServiceUnavailable => "service_unavailable",
            GatewayTimeout => "gateway_timeout",
            HttpVersionNotSupported => "http_version_not_supported",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}
