use super::types::header_has_token;
use super::{ParseError, ParseErrorKind, RequestHead, ResponseHead};

const CRLF: &[u8] = b"\r\n";

/// How the end of a message body is found on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    NoBody,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

impl BodyFraming {
    pub fn for_request(head: &RequestHead) -> Result<Self, ParseError> {
        if header_has_token(&head.headers, "transfer-encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        match head.header("content-length") {
            Some(value) => match parse_content_length(value)? {
                0 => Ok(BodyFraming::NoBody),
                length => Ok(BodyFraming::ContentLength(length)),
            },
            None => Ok(BodyFraming::NoBody),
        }
    }

    /// `request_method` is the method of the request this response answers;
    /// responses to HEAD never carry a body.
    pub fn for_response(head: &ResponseHead, request_method: &str) -> Result<Self, ParseError> {
        let status = head.line.status_code;
        if request_method.eq_ignore_ascii_case("HEAD")
            || status / 100 == 1
            || status == 204
            || status == 304
        {
            return Ok(BodyFraming::NoBody);
        }
        if header_has_token(&head.headers, "transfer-encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        match head.header("content-length") {
            Some(value) => match parse_content_length(value)? {
                0 => Ok(BodyFraming::NoBody),
                length => Ok(BodyFraming::ContentLength(length)),
            },
            None => Ok(BodyFraming::CloseDelimited),
        }
    }

    pub fn is_close_delimited(&self) -> bool {
        matches!(self, BodyFraming::CloseDelimited)
    }
}

fn parse_content_length(value: &str) -> Result<u64, ParseError> {
    value.trim().parse::<u64>().map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidContentLength,
        offset: 0,
    })
}

/// Longest chunk-size or trailer line accepted, CRLF included.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkState {
    Size { line: Vec<u8> },
    Data { remaining: u64 },
    DataCrlf { remaining: u8 },
    Trailer { line: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DecodeState {
    Length { remaining: u64 },
    Chunk(ChunkState),
    UntilEof,
    Done,
}

/// Walks a body on the wire without rewriting it.
///
/// `decode` reports how many input bytes belong to the current message so the
/// caller can forward them verbatim, and appends the de-framed payload to
/// `payload`. Bytes past the end of the message are left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDecoder {
    state: DecodeState,
    consumed: u64,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::NoBody | BodyFraming::ContentLength(0) => DecodeState::Done,
            BodyFraming::ContentLength(remaining) => DecodeState::Length { remaining },
            BodyFraming::Chunked => DecodeState::Chunk(ChunkState::Size { line: Vec::new() }),
            BodyFraming::CloseDelimited => DecodeState::UntilEof,
        };
        Self { state, consumed: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    pub fn decode(&mut self, input: &[u8], payload: &mut Vec<u8>) -> Result<usize, ParseError> {
        let base = self.consumed;
        let mut cursor = 0usize;

        while cursor < input.len() {
            let next = match &mut self.state {
                DecodeState::Done => break,
                DecodeState::UntilEof => {
                    payload.extend_from_slice(&input[cursor..]);
                    cursor = input.len();
                    None
                }
                DecodeState::Length { remaining } => {
                    let take = take_len(*remaining, input.len() - cursor);
                    payload.extend_from_slice(&input[cursor..cursor + take]);
                    cursor += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        Some(DecodeState::Done)
                    } else {
                        None
                    }
                }
                DecodeState::Chunk(ChunkState::Size { line }) => {
                    let byte = input[cursor];
                    cursor += 1;
                    line.push(byte);
                    if line.len() >= MAX_CHUNK_LINE && !line.ends_with(CRLF) {
                        return Err(decode_error(ParseErrorKind::InvalidChunkSize, base, cursor));
                    }
                    if line.ends_with(CRLF) {
                        let size = parse_chunk_size(&line[..line.len() - CRLF.len()])
                            .map_err(|kind| decode_error(kind, base, cursor))?;
                        match size {
                            None => {
                                line.clear();
                                None
                            }
                            Some(0) => Some(DecodeState::Chunk(ChunkState::Trailer {
                                line: Vec::new(),
                            })),
                            Some(size) => {
                                Some(DecodeState::Chunk(ChunkState::Data { remaining: size }))
                            }
                        }
                    } else {
                        None
                    }
                }
                DecodeState::Chunk(ChunkState::Data { remaining }) => {
                    let take = take_len(*remaining, input.len() - cursor);
                    payload.extend_from_slice(&input[cursor..cursor + take]);
                    cursor += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        Some(DecodeState::Chunk(ChunkState::DataCrlf { remaining: 2 }))
                    } else {
                        None
                    }
                }
                DecodeState::Chunk(ChunkState::DataCrlf { remaining }) => {
                    let byte = input[cursor];
                    let expected = if *remaining == 2 { b'\r' } else { b'\n' };
                    if byte != expected {
                        return Err(decode_error(
                            ParseErrorKind::InvalidChunkTerminator,
                            base,
                            cursor,
                        ));
                    }
                    cursor += 1;
                    *remaining -= 1;
                    if *remaining == 0 {
                        Some(DecodeState::Chunk(ChunkState::Size { line: Vec::new() }))
                    } else {
                        None
                    }
                }
                DecodeState::Chunk(ChunkState::Trailer { line }) => {
                    let byte = input[cursor];
                    cursor += 1;
                    line.push(byte);
                    if line.len() >= MAX_CHUNK_LINE && !line.ends_with(CRLF) {
                        return Err(decode_error(ParseErrorKind::HeaderTooLarge, base, cursor));
                    }
                    if line.ends_with(CRLF) {
                        if line.len() == CRLF.len() {
                            Some(DecodeState::Done)
                        } else {
                            line.clear();
                            None
                        }
                    } else {
                        None
                    }
                }
            };
            if let Some(next) = next {
                self.state = next;
            }
        }

        self.consumed += cursor as u64;
        Ok(cursor)
    }

    /// Signals that the peer closed the stream. Only a close-delimited body
    /// may end this way.
    pub fn finish_eof(&mut self) -> Result<(), ParseError> {
        match self.state {
            DecodeState::Done => Ok(()),
            DecodeState::UntilEof => {
                self.state = DecodeState::Done;
                Ok(())
            }
            _ => Err(ParseError {
                kind: ParseErrorKind::UnexpectedEof,
                offset: self.consumed as usize,
            }),
        }
    }
}

fn decode_error(kind: ParseErrorKind, base: u64, cursor: usize) -> ParseError {
    ParseError {
        kind,
        offset: (base as usize).saturating_add(cursor),
    }
}

fn take_len(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |remaining| remaining.min(available))
}

fn parse_chunk_size(line: &[u8]) -> Result<Option<u64>, ParseErrorKind> {
    let text = std::str::from_utf8(line).map_err(|_| ParseErrorKind::InvalidChunkSize)?;
    let size = text.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Ok(None);
    }
    u64::from_str_radix(size, 16)
        .map(Some)
        .map_err(|_| ParseErrorKind::InvalidChunkSize)
}
