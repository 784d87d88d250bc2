mod ca;
mod cert;
mod context;
mod keygen;
mod types;

pub use ca::{CA_CERT_FILE, CA_KEY_FILE, CaMaterialPaths, RootCa, generate_ca, write_ca_to_dir};
pub use cert::Signer;
pub use context::{TlsConfig, build_acceptor, build_connector};
pub use keygen::CounterStream;
pub use types::{CaMaterial, LeafCertificate, TlsError, TlsErrorKind};
