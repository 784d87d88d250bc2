mod parser;
mod stream;
mod types;

pub use parser::{HeadParser, ParseHead, ParseStatus, RequestParser, ResponseParser};
pub use stream::{BodyDecoder, BodyFraming};
pub use types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine,
};
