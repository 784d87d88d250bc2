use std::net::IpAddr;

use chrono::{Duration, Months, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::sha::Sha1;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Builder, X509NameBuilder, X509Ref};

use super::ca::RootCa;
use super::keygen::{CounterStream, p256_key, rsa_key};
use super::types::{LeafCertificate, TlsError, TlsErrorKind};

const LEAF_ORGANIZATION: &str = "Wiretap untrusted proxy";
const LEAF_VALIDITY_MONTHS: u32 = 120;
const SERIAL_BITS: i32 = 127;

fn version_tag() -> String {
    format!(":wiretap-{}", env!("CARGO_PKG_VERSION"))
}

/// Mints leaf certificates under a [`RootCa`].
///
/// Key material is derived from the root key and the sorted hostname set, so
/// the same hosts always get the same key pair. The serial is random per call.
#[derive(Debug, Clone)]
pub struct Signer {
    root: RootCa,
}

impl Signer {
    pub fn new(root: RootCa) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &RootCa {
        &self.root
    }

    pub fn sign<S: AsRef<str>>(&self, hostnames: &[S]) -> Result<LeafCertificate, TlsError> {
        let hostnames: Vec<String> = hostnames
            .iter()
            .map(|host| host.as_ref().to_string())
            .filter(|host| !host.is_empty())
            .collect();
        if hostnames.is_empty() {
            return Err(TlsError::new(TlsErrorKind::Signing, "no hostnames to sign"));
        }

        let key = self.leaf_key(&hostnames)?;
        let cert = self
            .build_certificate(&hostnames, &key)
            .map_err(|err| TlsError::new(TlsErrorKind::Signing, err.to_string()))?;

        Ok(LeafCertificate {
            hostnames,
            cert,
            key,
            chain: vec![self.root.cert.clone()],
        })
    }

    fn leaf_key(&self, hostnames: &[String]) -> Result<PKey<Private>, TlsError> {
        let algorithm = self.root.key.id();
        if algorithm != Id::RSA && algorithm != Id::EC {
            return Err(TlsError::new(
                TlsErrorKind::KeyTypeUnsupported,
                format!("root key type {algorithm:?} cannot sign leaves"),
            ));
        }

        let secret = self.root.key.private_key_to_der()?;
        let seed = hostname_digest(hostnames);
        let mut stream = CounterStream::new(&secret, &seed)?;
        if algorithm == Id::RSA {
            rsa_key(&mut stream)
        } else {
            p256_key(&mut stream)
        }
    }

    fn build_certificate(
        &self,
        hostnames: &[String],
        key: &PKey<Private>,
    ) -> Result<X509, TlsError> {
        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, LEAF_ORGANIZATION)?;
        if let Some(common_name) = hostnames
            .iter()
            .rev()
            .find(|host| host.parse::<IpAddr>().is_err())
        {
            name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        }
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.root.cert.subject_name())?;

        let now = Utc::now();
        let not_before = now - Duration::days(2);
        let not_after = now
            .checked_add_months(Months::new(LEAF_VALIDITY_MONTHS))
            .ok_or_else(|| TlsError::new(TlsErrorKind::Signing, "validity out of range"))?;
        let not_before = Asn1Time::from_unix(not_before.timestamp())?;
        let not_after = Asn1Time::from_unix(not_after.timestamp())?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(key)?;

        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(
            ExtendedKeyUsage::new()
                .client_auth()
                .server_auth()
                .build()?,
        )?;

        let (san, subject_key_id, authority_key_id) = {
            let issuer: &X509Ref = &self.root.cert;
            let context = builder.x509v3_context(Some(issuer), None);
            let mut san = SubjectAlternativeName::new();
            for host in hostnames {
                if host.parse::<IpAddr>().is_ok() {
                    san.ip(host);
                } else {
                    san.dns(host);
                }
            }
            (
                san.build(&context)?,
                SubjectKeyIdentifier::new().build(&context)?,
                AuthorityKeyIdentifier::new()
                    .keyid(false)
                    .issuer(false)
                    .build(&context)?,
            )
        };
        builder.append_extension(san)?;
        builder.append_extension(subject_key_id)?;
        builder.append_extension(authority_key_id)?;

        builder.sign(&self.root.key, MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

/// SHA-1 over the sorted hostnames and the build tag, each followed by `,`.
fn hostname_digest(hostnames: &[String]) -> [u8; 20] {
    let mut entries: Vec<String> = hostnames.to_vec();
    entries.push(version_tag());
    entries.sort();

    let mut hasher = Sha1::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b",");
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::{Id, PKey};
    use openssl::stack::Stack;
    use openssl::x509::store::X509StoreBuilder;
    use openssl::x509::{X509, X509Builder, X509NameBuilder, X509StoreContext};

    use super::{Signer, hostname_digest};
    use crate::tls::{RootCa, TlsErrorKind, generate_ca};

    fn chain_verifies(root: &X509, leaf: &X509) -> bool {
        let mut store = X509StoreBuilder::new().unwrap();
        store.add_cert(root.clone()).unwrap();
        let store = store.build();
        let chain: Stack<X509> = Stack::new().unwrap();
        let mut context = X509StoreContext::new().unwrap();
        context
            .init(&store, leaf, &chain, |ctx| ctx.verify_cert())
            .unwrap()
    }

    #[test]
    fn rsa_root_signs_deterministic_keys_with_fresh_serials() {
        let signer = Signer::new(RootCa::embedded().unwrap());
        let first = signer.sign(&["example.com"]).unwrap();
        let second = signer.sign(&["example.com"]).unwrap();

        assert_eq!(first.key.id(), Id::RSA);
        assert_eq!(first.key.bits(), 2048);
        assert_eq!(
            first.key.private_key_to_der().unwrap(),
            second.key.private_key_to_der().unwrap()
        );
        assert_ne!(first.serial_hex().unwrap(), second.serial_hex().unwrap());

        let root = signer.root().certificate();
        assert!(chain_verifies(root, &first.cert));
        assert!(chain_verifies(root, &second.cert));
    }

    #[test]
    fn ec_root_signs_p256_leaves() {
        let root = RootCa::from_material(&generate_ca("EC Root").unwrap()).unwrap();
        let signer = Signer::new(root);
        let first = signer.sign(&["api.example.com", "10.0.0.1"]).unwrap();
        let second = signer.sign(&["10.0.0.1", "api.example.com"]).unwrap();

        assert_eq!(first.key.id(), Id::EC);
        assert_eq!(
            first.key.private_key_to_der().unwrap(),
            second.key.private_key_to_der().unwrap()
        );
        assert!(chain_verifies(signer.root().certificate(), &first.cert));
    }

    #[test]
    fn splits_ip_and_dns_names() {
        let signer = Signer::new(RootCa::embedded().unwrap());
        let leaf = signer.sign(&["127.0.0.1", "localhost"]).unwrap();

        let names = leaf.cert.subject_alt_names().unwrap();
        let dns: Vec<&str> = names.iter().filter_map(|name| name.dnsname()).collect();
        let ips: Vec<&[u8]> = names.iter().filter_map(|name| name.ipaddress()).collect();
        assert_eq!(dns, vec!["localhost"]);
        assert_eq!(ips, vec![&[127u8, 0, 0, 1][..]]);

        let common_name = leaf
            .cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(common_name, "localhost");
    }

    #[test]
    fn validity_window_is_backdated() {
        let signer = Signer::new(RootCa::embedded().unwrap());
        let leaf = signer.sign(&["example.com"]).unwrap();
        let now = Asn1Time::days_from_now(0).unwrap();

        let before = leaf.cert.not_before().diff(&now).unwrap();
        assert!(before.days >= 1);
        let after = now.diff(leaf.cert.not_after()).unwrap();
        assert!(after.days > 3600);
    }

    #[test]
    fn different_hosts_get_different_keys() {
        let signer = Signer::new(RootCa::embedded().unwrap());
        let first = signer.sign(&["a.example"]).unwrap();
        let second = signer.sign(&["b.example"]).unwrap();
        assert_ne!(
            first.key.private_key_to_der().unwrap(),
            second.key.private_key_to_der().unwrap()
        );
    }

    #[test]
    fn digest_ignores_input_order() {
        let forward = hostname_digest(&["a".to_string(), "b".to_string()]);
        let reverse = hostname_digest(&["b".to_string(), "a".to_string()]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn empty_hostnames_fail() {
        let signer = Signer::new(RootCa::embedded().unwrap());
        let hosts: [&str; 0] = [];
        let error = signer.sign(&hosts).unwrap_err();
        assert_matches!(error.kind, TlsErrorKind::Signing);
    }

    #[test]
    fn ed25519_root_is_unsupported() {
        let key = PKey::generate_ed25519().unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, "Edwards Root").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::null()).unwrap();
        let cert = builder.build();

        let root = RootCa::from_pem(
            &cert.to_pem().unwrap(),
            &key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap();
        let error = Signer::new(root).sign(&["example.com"]).unwrap_err();
        assert_matches!(error.kind, TlsErrorKind::KeyTypeUnsupported);
    }
}
