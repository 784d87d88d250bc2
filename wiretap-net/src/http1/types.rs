use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
    pub raw_name: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            raw_name: name.clone(),
            name,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Other(String),
}

impl HttpVersion {
    pub fn as_str(&self) -> &str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Other(other) => other.as_str(),
        }
    }
}

/// Request line and header block of an HTTP/1.x request. The body is streamed
/// separately through a [`BodyDecoder`](super::BodyDecoder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub line: StatusLine,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn remove_header(&mut self, name: &str) -> usize {
        remove_header(&mut self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value.into());
    }

    pub fn is_connect(&self) -> bool {
        self.line.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn content_length(&self) -> Option<u64> {
        content_length(&self.headers)
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(&self.line.version, &self.headers)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.line.method,
                self.line.target,
                self.line.version.as_str()
            )
            .as_bytes(),
        );
        encode_headers(&mut bytes, &self.headers);
        bytes
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn remove_header(&mut self, name: &str) -> usize {
        remove_header(&mut self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value.into());
    }

    pub fn content_length(&self) -> Option<u64> {
        content_length(&self.headers)
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(&self.line.version, &self.headers)
    }

    /// 1xx responses other than `101 Switching Protocols` precede the final response.
    pub fn is_interim(&self) -> bool {
        self.line.status_code / 100 == 1 && self.line.status_code != 101
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.line.version.as_str(),
                self.line.status_code,
                self.line.reason
            )
            .as_bytes(),
        );
        encode_headers(&mut bytes, &self.headers);
        bytes
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn remove_header(headers: &mut Vec<Header>, name: &str) -> usize {
    let before = headers.len();
    headers.retain(|header| !header.name.eq_ignore_ascii_case(name));
    before - headers.len()
}

fn set_header(headers: &mut Vec<Header>, name: &str, value: String) {
    match headers
        .iter_mut()
        .find(|header| header.name.eq_ignore_ascii_case(name))
    {
        Some(header) => header.value = value,
        None => headers.push(Header::new(name, value)),
    }
}

fn content_length(headers: &[Header]) -> Option<u64> {
    find_header(headers, "content-length").and_then(|value| value.trim().parse::<u64>().ok())
}

pub(crate) fn header_has_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers.iter().any(|header| {
        header.name.eq_ignore_ascii_case(name)
            && header
                .value
                .split(',')
                .any(|value| value.trim().eq_ignore_ascii_case(token))
    })
}

fn keep_alive(version: &HttpVersion, headers: &[Header]) -> bool {
    match version {
        HttpVersion::Http10 => header_has_token(headers, "connection", "keep-alive"),
        _ => !header_has_token(headers, "connection", "close"),
    }
}

fn encode_headers(bytes: &mut Vec<u8>, headers: &[Header]) {
    for header in headers {
        let name = if header.raw_name.is_empty() {
            &header.name
        } else {
            &header.raw_name
        };
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(header.value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }
    bytes.extend_from_slice(b"\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_header_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub kind: ParseWarningKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseWarningKind {
    UnknownVersion(String),
    ObsFoldDetected,
    InvalidHeaderName,
    InvalidHeaderValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} at offset {offset}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidStartLine,
    InvalidStatusLine,
    InvalidHeader,
    InvalidContentLength,
    HeaderTooLarge,
    InvalidChunkSize,
    InvalidChunkTerminator,
    UnexpectedEof,
}
