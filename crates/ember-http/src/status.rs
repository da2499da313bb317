//! HTTP status codes spoken by the server, including the non-standard
//! 430 used to ask the client for a resource decryption key.

pub const OK: u16 = 200;
pub const CREATED: u16 = 201;
pub const ACCEPTED: u16 = 202;
pub const NO_CONTENT: u16 = 204;
pub const MOVED_PERMANENTLY: u16 = 301;
pub const MOVED_TEMPORARILY: u16 = 302;
pub const NOT_MODIFIED: u16 = 304;
pub const BAD_REQUEST: u16 = 400;
pub const UNAUTHORIZED: u16 = 401;
pub const FORBIDDEN: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const REQUEST_TIMEOUT: u16 = 408;
pub const LENGTH_REQUIRED: u16 = 411;
pub const REQUEST_TOO_LARGE: u16 = 413;
pub const EXT_KEY_NEEDED: u16 = 430;
pub const INTERNAL_SERVER_ERROR: u16 = 500;
pub const NOT_IMPLEMENTED: u16 = 501;
pub const BAD_GATEWAY: u16 = 502;
pub const SERVICE_UNAVAILABLE: u16 = 503;

pub fn desc(status: u16) -> &'static str {
    match status {
        OK => "OK",
        CREATED => "Created",
        ACCEPTED => "Accepted",
        NO_CONTENT => "No Content",
        MOVED_PERMANENTLY => "Moved Permanently",
        MOVED_TEMPORARILY => "Moved Temporarily",
        NOT_MODIFIED => "Not Modified",
        BAD_REQUEST => "Bad Request",
        UNAUTHORIZED => "Unauthorized",
        FORBIDDEN => "Forbidden",
        NOT_FOUND => "Not Found",
        REQUEST_TIMEOUT => "Request Timeout",
        LENGTH_REQUIRED => "Content-Length required",
        REQUEST_TOO_LARGE => "Request data too big",
        EXT_KEY_NEEDED => "Key needed",
        INTERNAL_SERVER_ERROR => "Internal Server Error",
        NOT_IMPLEMENTED => "Not Implemented",
        BAD_GATEWAY => "Bad Gateway",
        SERVICE_UNAVAILABLE => "Service Unavailable",
        _ => "Unknown Status Code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc() {
        assert_eq!(desc(200), "OK");
        assert_eq!(desc(430), "Key needed");
        assert_eq!(desc(999), "Unknown Status Code");
    }
}
