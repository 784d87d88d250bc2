use std::marker::PhantomData;

use super::types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine,
};

const HEAD_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore {
        warnings: Vec<ParseWarning>,
    },
    Complete {
        message: T,
        warnings: Vec<ParseWarning>,
    },
    Error {
        error: ParseError,
        warnings: Vec<ParseWarning>,
    },
}

/// A message head buildable from its start line plus parsed header fields.
pub trait ParseHead: Sized {
    fn from_parts(
        start_line: &str,
        headers: Vec<Header>,
        warnings: &mut Vec<ParseWarning>,
    ) -> Result<Self, ParseError>;
}

impl ParseHead for RequestHead {
    fn from_parts(
        start_line: &str,
        headers: Vec<Header>,
        warnings: &mut Vec<ParseWarning>,
    ) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = start_line.split_ascii_whitespace().collect();
        let [method, target, version] = tokens.as_slice() else {
            return Err(error_at(ParseErrorKind::InvalidStartLine, 0));
        };
        Ok(RequestHead {
            line: RequestLine {
                method: (*method).to_string(),
                target: (*target).to_string(),
                version: version_of(version, warnings),
            },
            headers,
        })
    }
}

impl ParseHead for ResponseHead {
    fn from_parts(
        start_line: &str,
        headers: Vec<Header>,
        warnings: &mut Vec<ParseWarning>,
    ) -> Result<Self, ParseError> {
        let invalid = || error_at(ParseErrorKind::InvalidStatusLine, 0);
        let (version, rest) = start_line.split_once(' ').ok_or_else(invalid)?;
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status_code = code
            .parse::<u16>()
            .ok()
            .filter(|code| (100..1000).contains(code))
            .ok_or_else(invalid)?;
        Ok(ResponseHead {
            line: StatusLine {
                version: version_of(version, warnings),
                status_code,
                reason: reason.to_string(),
            },
            headers,
        })
    }
}

/// Incremental head parser. Feed bytes with [`HeadParser::push`]; once a head
/// completes, whatever followed it (body, pipelined requests) stays buffered
/// for [`HeadParser::take_remaining`].
#[derive(Debug)]
pub struct HeadParser<H> {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
    scanned: usize,
    _head: PhantomData<fn() -> H>,
}

pub type RequestParser = HeadParser<RequestHead>;
pub type ResponseParser = HeadParser<ResponseHead>;

impl<H> Default for HeadParser<H> {
    fn default() -> Self {
        Self::with_limits(Limits::default())
    }
}

impl<H> HeadParser<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
            scanned: 0,
            _head: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn take_remaining(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.buffer)
    }
}

impl<H: ParseHead> HeadParser<H> {
    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<H> {
        self.buffer.extend_from_slice(bytes);

        let end = match self.head_end() {
            Ok(Some(end)) => end,
            Ok(None) => {
                return ParseStatus::NeedMore {
                    warnings: self.warnings.clone(),
                };
            }
            Err(error) => return self.fail(error),
        };

        let parsed = parse_block(&self.buffer[..end], &mut self.warnings);
        match parsed {
            Ok(message) => {
                self.buffer.drain(..end + HEAD_END.len());
                self.scanned = 0;
                ParseStatus::Complete {
                    message,
                    warnings: std::mem::take(&mut self.warnings),
                }
            }
            Err(error) => self.fail(error),
        }
    }

    fn head_end(&mut self) -> Result<Option<usize>, ParseError> {
        // Resume a few bytes back so a terminator split across pushes is found.
        let from = self.scanned.saturating_sub(HEAD_END.len() - 1);
        let found = twoway::find_bytes(&self.buffer[from..], HEAD_END).map(|index| from + index);
        self.scanned = self.buffer.len();

        let size = found.unwrap_or(self.buffer.len());
        if size > self.limits.max_header_bytes {
            return Err(error_at(
                ParseErrorKind::HeaderTooLarge,
                self.limits.max_header_bytes,
            ));
        }
        Ok(found)
    }

    fn fail(&mut self, error: ParseError) -> ParseStatus<H> {
        ParseStatus::Error {
            error,
            warnings: std::mem::take(&mut self.warnings),
        }
    }
}

fn parse_block<H: ParseHead>(block: &[u8], warnings: &mut Vec<ParseWarning>) -> Result<H, ParseError> {
    let (start, fields) = match twoway::find_bytes(block, b"\r\n") {
        Some(index) => (&block[..index], &block[index + 2..]),
        None => (block, &block[block.len()..]),
    };
    let start_line = std::str::from_utf8(start)
        .map_err(|_| error_at(ParseErrorKind::InvalidStartLine, 0))?;
    let headers = parse_fields(fields, start.len() + 2, warnings)?;
    H::from_parts(start_line, headers, warnings)
}

fn parse_fields(
    fields: &[u8],
    base: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<Vec<Header>, ParseError> {
    let text =
        std::str::from_utf8(fields).map_err(|_| error_at(ParseErrorKind::InvalidHeader, base))?;

    let mut headers: Vec<Header> = Vec::new();
    let mut offset = base;
    for line in text.split("\r\n") {
        let at = offset;
        offset += line.len() + 2;
        if line.is_empty() {
            continue;
        }

        if line.starts_with([' ', '\t']) {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::ObsFoldDetected,
                offset: at,
            });
            if let Some(previous) = headers.last_mut() {
                previous.value.push(' ');
                previous.value.push_str(line.trim());
                continue;
            }
        }

        let (raw_name, value) = line.split_once(':').unwrap_or((line, ""));
        let name = raw_name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidHeaderName,
                offset: at,
            });
        }
        if value.contains(['\r', '\n']) {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidHeaderValue,
                offset: at,
            });
        }
        headers.push(Header {
            name: name.to_string(),
            raw_name: raw_name.trim_end().to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(headers)
}

fn version_of(raw: &str, warnings: &mut Vec<ParseWarning>) -> HttpVersion {
    match raw {
        "HTTP/1.1" => HttpVersion::Http11,
        "HTTP/1.0" => HttpVersion::Http10,
        other => {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::UnknownVersion(other.to_string()),
                offset: 0,
            });
            HttpVersion::Other(other.to_string())
        }
    }
}

fn error_at(kind: ParseErrorKind, offset: usize) -> ParseError {
    ParseError { kind, offset }
}
