//! TLS configuration shared by the relay listener and the agent connector.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;

use crate::IdentityError;

/// Install the ring crypto provider as the process default. Idempotent;
/// call before any rustls config is built (including by HTTP clients).
pub fn init_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Parse every certificate in a PEM string.
pub fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| IdentityError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(IdentityError::Pem("no certificates in PEM input".into()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM string.
pub fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, IdentityError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| IdentityError::Pem(e.to_string()))?
        .ok_or_else(|| IdentityError::Pem("no private key in PEM input".into()))
}

fn root_store(ca_pem: &str) -> Result<RootCertStore, IdentityError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_pem)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Relay-side TLS config. When `client_ca_pem` is set the listener requires
/// client certificates chaining to that CA (mTLS-first); without it the
/// listener accepts anonymous clients and the bearer-token fallback applies.
pub fn server_config(
    cert_pem: &str,
    key_pem: &str,
    client_ca_pem: Option<&str>,
) -> Result<ServerConfig, IdentityError> {
    init_crypto_provider();
    let certs = load_certs(cert_pem)?;
    let key = load_private_key(key_pem)?;

    let config = match client_ca_pem {
        Some(ca_pem) => {
            let roots = root_store(ca_pem)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| IdentityError::Parse(e.to_string()))?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
    };
    Ok(config)
}

/// Agent-side TLS config trusting the fleet CA, optionally presenting a
/// node client certificate.
pub fn client_config(
    server_ca_pem: &str,
    client_identity: Option<(&str, &str)>,
) -> Result<ClientConfig, IdentityError> {
    init_crypto_provider();
    let roots = root_store(server_ca_pem)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let config = match client_identity {
        Some((cert_pem, key_pem)) => {
            let certs = load_certs(cert_pem)?;
            let key = load_private_key(key_pem)?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertificateAuthority;

    #[test]
    fn mutual_tls_configs_build_from_issued_material() {
        let ca = CertificateAuthority::generate("armada-test").unwrap();
        let server = ca.issue_server(&["localhost".to_string()]).unwrap();
        let node = ca.issue_node("node-1").unwrap();
        let ca_pem = ca.ca_cert_pem();

        server_config(&server.cert_pem, &server.key_pem, Some(&ca_pem)).unwrap();
        client_config(&ca_pem, Some((&node.cert_pem, &node.key_pem))).unwrap();
    }

    #[test]
    fn server_config_without_client_ca_allows_anonymous() {
        let ca = CertificateAuthority::generate("armada-test").unwrap();
        let server = ca.issue_server(&["localhost".to_string()]).unwrap();
        server_config(&server.cert_pem, &server.key_pem, None).unwrap();
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(load_certs("not pem at all").is_err());
        assert!(load_private_key("not pem at all").is_err());
    }
}
