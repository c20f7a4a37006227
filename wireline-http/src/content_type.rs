/// Collection of known content types.
pub struct ContentType;

impl ContentType {
    pub const JSON: &'static str = "application/json";
    pub const XML: &'static str = "application/xml";
    pub const X_WWW_FORM_URLENCODED: &'static str = "application/x-www-form-urlencoded";
}
