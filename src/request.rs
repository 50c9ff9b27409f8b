use crate::error::RequestError;

// To prevent a malformed request from eating up too much memory, drop it once it exceeds
// this many bytes:
pub const MAX_REQUEST_LENGTH: usize = 4000;

/// A request line plus headers, as read from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Uppercase method.
    pub method: String,
    /// Raw request target, possibly with a query string and percent-escapes.
    pub path: String,
    pub protocol: Option<String>,
    headers: Vec<(String, String)>,
}

impl ParsedRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            protocol: None,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First value of a header. Names are compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Part of the path after the first `?`, without any fragment.
    pub fn query(&self) -> &str {
        match self.path.split_once('?') {
            Some((_, query)) => query.split('#').next().unwrap_or(""),
            None => "",
        }
    }

    /// Parse an HTTP request like "GET / HTTP/1.1" followed by header lines.
    pub fn parse(request: &[u8]) -> Result<Self, RequestError> {
        if request.len() > MAX_REQUEST_LENGTH {
            return Err(RequestError::RequestTooLarge);
        }
        let request = std::str::from_utf8(request).map_err(|_| RequestError::BadRequest)?;
        let mut lines = request.split('\n').map(|line| line.trim_end_matches('\r'));
        let mut request_line = lines
            .next()
            .ok_or(RequestError::BadRequest)?
            .split(' ')
            .filter(|part| !part.is_empty());

        let method = request_line.next().ok_or(RequestError::BadRequest)?;
        let path = request_line.next().ok_or(RequestError::BadRequest)?;
        let mut parsed = Self::new(method, path);
        parsed.protocol = request_line.next().map(str::to_uppercase);

        for line in lines {
            if line.is_empty() {
                break;
            }
            // Lines without a colon are ignored rather than rejected.
            if let Some((name, value)) = line.split_once(':') {
                parsed = parsed.with_header(name.trim(), value.trim());
            }
        }
        Ok(parsed)
    }
}

/// True once `buf` holds a complete request head.
pub fn is_complete(buf: &[u8]) -> bool {
    buf.ends_with(b"\n\n") || buf.ends_with(b"\r\n\r\n")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_works() {
        let request = ParsedRequest::parse(
            b"get /a%20b?x=1#frag HTTP/1.1\r\nHost: example.com\r\nuser-agent:  curl \r\n\r\n",
        )
        .unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/a%20b?x=1#frag");
        assert_eq!(request.protocol.as_deref(), Some("HTTP/1.1"));
        assert_eq!(request.header("host"), Some("example.com"));
        assert_eq!(request.header("User-Agent"), Some("curl"));
        assert_eq!(request.header("Referer"), None);
        assert_eq!(request.query(), "x=1");
    }

    #[test]
    fn parse_accepts_bare_newlines_and_http09() {
        let request = ParsedRequest::parse(b"GET /\nAuthorization: Basic abc\n\n").unwrap();
        assert_eq!(request.protocol, None);
        assert_eq!(request.header("authorization"), Some("Basic abc"));
        assert_eq!(request.query(), "");
    }

    #[test]
    fn parse_rejects_missing_path() {
        assert_eq!(
            ParsedRequest::parse(b"GET\r\n\r\n"),
            Err(RequestError::BadRequest)
        );
        assert_eq!(ParsedRequest::parse(b"\r\n\r\n"), Err(RequestError::BadRequest));
    }

    #[test]
    fn parse_rejects_large_requests() {
        let mut request = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        request.resize(MAX_REQUEST_LENGTH + 1, b'a');
        assert_eq!(
            ParsedRequest::parse(&request),
            Err(RequestError::RequestTooLarge)
        );
    }

    #[test]
    fn is_complete_works() {
        assert!(is_complete(b"GET / HTTP/1.1\r\n\r\n"));
        assert!(is_complete(b"GET /\n\n"));
        assert!(!is_complete(b"GET / HTTP/1.1\r\n"));
    }
}
