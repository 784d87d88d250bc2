mod http1;
mod tls;

pub use http1::{
    BodyDecoder, BodyFraming, HeadParser, Header, HttpVersion, Limits, ParseError, ParseErrorKind,
    ParseHead, ParseStatus, ParseWarning, ParseWarningKind, RequestHead, RequestLine,
    RequestParser, ResponseHead, ResponseParser, StatusLine,
};

pub use tls::{
    CA_CERT_FILE, CA_KEY_FILE, CaMaterial, CaMaterialPaths, CounterStream, LeafCertificate,
    RootCa, Signer, TlsConfig, TlsError, TlsErrorKind, build_acceptor, build_connector,
    generate_ca, write_ca_to_dir,
};
