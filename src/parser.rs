// src/parser.rs
//! Incremental request parsing. Received chunks accumulate in a buffer
//! and httparse re-runs over the whole prefix after each feed; once the
//! head is through, completion is a byte count against Content-Length.

use crate::http::Request;

pub const MAX_HEADERS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request")]
    Malformed,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("transfer-encoding is not supported")]
    UnsupportedEncoding,
    #[error("invalid content-length")]
    BadContentLength,
}

struct Head {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    header_len: usize,
    content_len: usize,
}

pub struct RequestParser {
    buf: Vec<u8>,
    head: Option<Head>,
    complete: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            head: None,
            complete: false,
        }
    }

    /// Feed one received chunk. Completion latches; bytes fed after the
    /// message is complete are ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
        if self.complete {
            return Ok(());
        }
        self.buf.extend_from_slice(chunk);

        if self.head.is_none() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&self.buf) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let method = req.method.ok_or(ParseError::Malformed)?.to_string();
                    let url = req.path.ok_or(ParseError::Malformed)?.to_string();

                    let mut content_len = 0usize;
                    let mut parsed = Vec::with_capacity(req.headers.len());
                    for h in req.headers.iter() {
                        let value =
                            std::str::from_utf8(h.value).map_err(|_| ParseError::Malformed)?;
                        if h.name.eq_ignore_ascii_case("transfer-encoding") {
                            return Err(ParseError::UnsupportedEncoding);
                        }
                        if h.name.eq_ignore_ascii_case("content-length") {
                            content_len = value
                                .trim()
                                .parse()
                                .map_err(|_| ParseError::BadContentLength)?;
                        }
                        parsed.push((h.name.to_string(), value.to_string()));
                    }

                    self.head = Some(Head {
                        method,
                        url,
                        headers: parsed,
                        header_len,
                        content_len,
                    });
                }
                Ok(httparse::Status::Partial) => return Ok(()),
                Err(httparse::Error::TooManyHeaders) => return Err(ParseError::TooManyHeaders),
                Err(_) => return Err(ParseError::Malformed),
            }
        }

        if let Some(head) = &self.head
            && self.buf.len() - head.header_len >= head.content_len
        {
            self.complete = true;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The parsed message. Only valid once complete.
    pub fn into_request(self) -> Result<Request, ParseError> {
        if !self.complete {
            return Err(ParseError::Malformed);
        }
        let head = self.head.ok_or(ParseError::Malformed)?;
        let body = self.buf[head.header_len..head.header_len + head.content_len].to_vec();
        Ok(Request {
            method: head.method,
            url: head.url,
            headers: head.headers,
            body,
        })
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVATE: &[u8] = b"POST /Plugin.Activate HTTP/1.1\r\nContent-Length: 0\r\n\r\n";

    #[test]
    fn single_feed_completes() {
        let mut p = RequestParser::new();
        p.feed(ACTIVATE).unwrap();
        assert!(p.is_complete());

        let req = p.into_request().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "/Plugin.Activate");
        assert_eq!(req.header("Content-Length"), Some("0"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn any_chunking_completes_exactly_once() {
        let msg = b"POST /NetworkDriver.CreateNetwork HTTP/1.1\r\nHost: docker\r\nContent-Length: 11\r\n\r\n{\"Id\":\"n1\"}";
        for split in 1..msg.len() {
            let mut p = RequestParser::new();
            let mut completions = 0;
            for chunk in msg.chunks(split) {
                let was = p.is_complete();
                p.feed(chunk).unwrap();
                if p.is_complete() && !was {
                    completions += 1;
                }
            }
            assert_eq!(completions, 1, "split {split}");
            let req = p.into_request().unwrap();
            assert_eq!(req.url, "/NetworkDriver.CreateNetwork");
            assert_eq!(req.body, b"{\"Id\":\"n1\"}");
        }
    }

    #[test]
    fn byte_by_byte_stays_incomplete_until_the_end() {
        let mut p = RequestParser::new();
        for (i, b) in ACTIVATE.iter().enumerate() {
            p.feed(std::slice::from_ref(b)).unwrap();
            if i + 1 < ACTIVATE.len() {
                assert!(!p.is_complete(), "completed early at byte {i}");
            }
        }
        assert!(p.is_complete());
    }

    #[test]
    fn body_waits_for_content_length() {
        let mut p = RequestParser::new();
        p.feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nab").unwrap();
        assert!(!p.is_complete());
        p.feed(b"cde").unwrap();
        assert!(p.is_complete());
        assert_eq!(p.into_request().unwrap().body, b"abcde");
    }

    #[test]
    fn garbage_is_rejected() {
        let mut p = RequestParser::new();
        assert!(matches!(
            p.feed(b"\0\0\0 not http\r\n\r\n"),
            Err(ParseError::Malformed)
        ));
    }

    #[test]
    fn chunked_encoding_is_rejected() {
        let mut p = RequestParser::new();
        assert!(matches!(
            p.feed(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"),
            Err(ParseError::UnsupportedEncoding)
        ));
    }

    #[test]
    fn bad_content_length_is_rejected() {
        let mut p = RequestParser::new();
        assert!(matches!(
            p.feed(b"POST /x HTTP/1.1\r\nContent-Length: banana\r\n\r\n"),
            Err(ParseError::BadContentLength)
        ));
    }
}
