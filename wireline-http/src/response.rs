use bytes::Bytes;

use crate::header::Header;
use crate::status::Status;

/// An HTTP response: status, header set, and (for non-streaming requests)
/// the accumulated body.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub header: Header,
    /// Empty for streaming requests; their body goes to the data handler.
    pub body: Bytes,
}

impl Response {
    /// The body as text (lossy for non-UTF-8 bytes).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
