use openssl::ssl::{
    AlpnError, SslAcceptor, SslAcceptorBuilder, SslConnector, SslMethod, SslOptions,
    SslVerifyMode, select_next_proto,
};

use super::types::{LeafCertificate, TlsError};

const ALPN_HTTP11: &[u8] = b"\x08http/1.1";

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub allow_legacy: bool,
}

/// Server-side context presenting `leaf` to the intercepted client. Only
/// HTTP/1.1 is negotiated since the tunnel speaks HTTP/1.x.
pub fn build_acceptor(config: &TlsConfig, leaf: &LeafCertificate) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;

    apply_legacy(&mut builder, config.allow_legacy)?;

    builder.set_certificate(&leaf.cert)?;
    builder.set_private_key(&leaf.key)?;
    for cert in &leaf.chain {
        builder.add_extra_chain_cert(cert.clone())?;
    }
    builder.check_private_key()?;

    builder.set_alpn_select_callback(|_, client| {
        select_next_proto(ALPN_HTTP11, client).ok_or(AlpnError::NOACK)
    });
    builder.set_verify(SslVerifyMode::NONE);

    Ok(builder.build())
}

/// Client-side context for upstream origins. Certificates are not verified.
pub fn build_connector() -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_alpn_protos(ALPN_HTTP11)?;
    Ok(builder.build())
}

fn apply_legacy(builder: &mut SslAcceptorBuilder, allow_legacy: bool) -> Result<(), TlsError> {
    if allow_legacy {
        builder.set_options(SslOptions::NO_TICKET);
        builder.clear_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
        builder.set_cipher_list("ALL:@SECLEVEL=0")?;
    } else {
        builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{TlsConfig, build_acceptor, build_connector};
    use crate::tls::{RootCa, Signer};

    #[test]
    fn builds_acceptor_for_signed_leaf() {
        let signer = Signer::new(RootCa::embedded().unwrap());
        let leaf = signer.sign(&["example.com"]).unwrap();
        build_acceptor(&TlsConfig::default(), &leaf).unwrap();
        build_acceptor(&TlsConfig { allow_legacy: true }, &leaf).unwrap();
    }

    #[test]
    fn builds_connector() {
        build_connector().unwrap();
    }
}
