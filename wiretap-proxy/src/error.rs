use thiserror::Error;
use wiretap_net::{ParseError, TlsError};
use wiretap_storage::StorageError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy runtime error: {0}")]
    Runtime(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed HTTP message: {0}")]
    Protocol(#[from] ParseError),
    #[error("connection cannot be hijacked")]
    HijackUnsupported,
    #[error("certificate error: {0}")]
    Certificate(#[from] TlsError),
    #[error("client TLS handshake failed: {0}")]
    ClientHandshake(String),
    #[error("dialing upstream {addr} failed: {message}")]
    UpstreamDial { addr: String, message: String },
    #[error("upstream TLS handshake with {addr} failed: {message}")]
    UpstreamTls { addr: String, message: String },
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),
    #[error("history error: {0}")]
    History(#[from] StorageError),
}
