use openssl::error::ErrorStack;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CaMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// A leaf certificate minted for one CONNECT target, together with the chain
/// that should be presented after it.
#[derive(Clone)]
pub struct LeafCertificate {
    pub hostnames: Vec<String>,
    pub cert: X509,
    pub key: PKey<Private>,
    pub chain: Vec<X509>,
}

impl LeafCertificate {
    pub fn cert_pem(&self) -> Result<Vec<u8>, TlsError> {
        Ok(self.cert.to_pem()?)
    }

    pub fn key_pem(&self) -> Result<Vec<u8>, TlsError> {
        Ok(self.key.private_key_to_pem_pkcs8()?)
    }

    pub fn serial_hex(&self) -> Result<String, TlsError> {
        let serial = self.cert.serial_number().to_bn()?;
        Ok(serial.to_hex_str()?.to_string())
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hostnames", &self.hostnames)
            .field("serial", &self.serial_hex().ok())
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    KeyTypeUnsupported,
    Signing,
    OpenSsl,
    Rcgen,
    Io,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ErrorStack> for TlsError {
    fn from(err: ErrorStack) -> Self {
        TlsError::new(TlsErrorKind::OpenSsl, err.to_string())
    }
}
