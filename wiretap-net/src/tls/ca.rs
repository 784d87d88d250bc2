use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, Months, Utc};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyUsagePurpose};

use super::types::{CaMaterial, TlsError, TlsErrorKind};

const EMBEDDED_CERT_PEM: &[u8] = include_bytes!("root_ca.crt");
const EMBEDDED_KEY_PEM: &[u8] = include_bytes!("root_ca.key");

const DEFAULT_CA_VALIDITY_MONTHS: u32 = 120;

pub const CA_CERT_FILE: &str = "wiretap-ca.pem";
pub const CA_KEY_FILE: &str = "wiretap-ca-key.pem";

/// The root every leaf is signed under. Loaded once and shared read-only.
#[derive(Clone)]
pub struct RootCa {
    pub(crate) cert: X509,
    pub(crate) key: PKey<Private>,
}

impl RootCa {
    /// The root compiled into the binary. Clients must trust it out of band.
    pub fn embedded() -> Result<Self, TlsError> {
        Self::from_pem(EMBEDDED_CERT_PEM, EMBEDDED_KEY_PEM)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::from_pem(cert_pem)?;
        let key = PKey::private_key_from_pem(key_pem)?;
        if !cert.public_key()?.public_eq(&key) {
            return Err(TlsError::new(
                TlsErrorKind::Signing,
                "root private key does not match root certificate",
            ));
        }
        Ok(Self { cert, key })
    }

    pub fn from_material(material: &CaMaterial) -> Result<Self, TlsError> {
        Self::from_pem(&material.cert_pem, &material.key_pem)
    }

    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        let cert_pem = fs::read(cert_path.as_ref())
            .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
        let key_pem = fs::read(key_path.as_ref())
            .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>, TlsError> {
        Ok(self.cert.to_pem()?)
    }
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("key", &self.key.id())
            .finish()
    }
}

/// Generates a fresh ECDSA P-256 root for operators who do not want to use the
/// embedded one.
pub fn generate_ca(common_name: &str) -> Result<CaMaterial, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Wiretap");
    params.distinguished_name = dn;

    let valid_from = Utc::now()
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| TlsError::new(TlsErrorKind::Rcgen, "CA validity out of range"))?;
    let valid_until = valid_from
        .checked_add_months(Months::new(DEFAULT_CA_VALIDITY_MONTHS))
        .ok_or_else(|| TlsError::new(TlsErrorKind::Rcgen, "CA validity out of range"))?;
    params.not_before = rcgen::date_time_ymd(
        valid_from.year(),
        valid_from.month() as u8,
        valid_from.day() as u8,
    );
    params.not_after = rcgen::date_time_ymd(
        valid_until.year(),
        valid_until.month() as u8,
        valid_until.day() as u8,
    );

    serialize_ca(params)
}

fn serialize_ca(params: CertificateParams) -> Result<CaMaterial, TlsError> {
    let cert = Certificate::from_params(params)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;

    let cert_pem = cert
        .serialize_pem()
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?
        .into_bytes();
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(CaMaterial { cert_pem, key_pem })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterialPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

pub fn write_ca_to_dir(
    dir: impl AsRef<Path>,
    material: &CaMaterial,
) -> Result<CaMaterialPaths, TlsError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    fs::write(&cert_path, &material.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(&key_path, &material.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    Ok(CaMaterialPaths {
        cert_path,
        key_path,
    })
}
