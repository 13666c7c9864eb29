// src/http.rs
use std::io::Write;

/// A fully parsed request, handed to a route handler once the parser
/// reports the message complete.
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    /// A fresh response: 200 with an empty body.
    pub fn new() -> Self {
        Self {
            status: 200,
            body: Vec::new(),
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Wire form: status line, Content-Length, blank line, body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        let _ = write!(
            out,
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
            self.status,
            reason_phrase(self.status),
            self.body.len()
        );
        out.extend_from_slice(&self.body);
        out
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_empty_body() {
        let resp = Response::new();
        assert_eq!(
            resp.serialize(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn serialize_carries_the_body_length() {
        let mut resp = Response::new();
        resp.set_body(&b"{\"Implements\":[\"NetworkDriver\"]}"[..]);
        assert_eq!(
            resp.serialize(),
            &b"HTTP/1.1 200 OK\r\nContent-Length: 32\r\n\r\n{\"Implements\":[\"NetworkDriver\"]}"[..]
        );
    }

    #[test]
    fn serialize_error_status() {
        let resp = Response::with_status(500);
        assert_eq!(
            resp.serialize(),
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = Request {
            method: "POST".to_string(),
            url: "/Plugin.Activate".to_string(),
            headers: vec![("Content-Length".to_string(), "0".to_string())],
            body: Vec::new(),
        };
        assert_eq!(req.header("content-length"), Some("0"));
        assert_eq!(req.header("host"), None);
    }
}
