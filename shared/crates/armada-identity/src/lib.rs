//! # Armada Identity
//!
//! Fleet identity for the relay and its node agents. A self-signed elliptic
//! curve CA issues server certificates (SANs for the relay hosts) and
//! per-node client certificates whose Common Name is the node id. The relay
//! verifies presented certificates against the CA and treats the CN as the
//! authenticated node identity.

pub mod tls;

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Default validity for issued certificates.
const LEAF_VALIDITY_DAYS: i64 = 825;
/// Default validity for the CA itself.
const CA_VALIDITY_DAYS: i64 = 3650;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("certificate parse failed: {0}")]
    Parse(String),
    #[error("certificate is outside its validity window")]
    OutsideValidity,
    #[error("certificate was not issued by the configured CA")]
    UntrustedIssuer,
    #[error("certificate signature verification failed")]
    BadSignature,
    #[error("certificate has no common name")]
    MissingCommonName,
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid PEM material: {0}")]
    Pem(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// PEM/DER bundle for an issued certificate and its private key.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

impl IssuedCert {
    /// Write `<name>.crt` / `<name>.key` under `dir`.
    pub fn write_to(&self, dir: &Path, name: &str) -> Result<(), IdentityError> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(format!("{}.crt", name)), &self.cert_pem)?;
        std::fs::write(dir.join(format!("{}.key", name)), &self.key_pem)?;
        Ok(())
    }
}

/// Fleet certificate authority.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    fleet_tag: String,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA for the given fleet tag.
    pub fn generate(fleet_tag: impl Into<String>) -> Result<Self, IdentityError> {
        let fleet_tag = fleet_tag.into();
        let key = KeyPair::generate()?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{} fleet ca", fleet_tag));
        dn.push(DnType::OrganizationName, fleet_tag.clone());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.serial_number = Some(random_serial());
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key, fleet_tag })
    }

    /// Reload a CA from persisted PEM material.
    pub fn from_pem(cert_pem: &str, key_pem: &str, fleet_tag: impl Into<String>) -> Result<Self, IdentityError> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let cert = params.self_signed(&key)?;
        Ok(Self {
            cert,
            key,
            fleet_tag: fleet_tag.into(),
        })
    }

    pub fn fleet_tag(&self) -> &str {
        &self.fleet_tag
    }

    pub fn ca_cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn ca_cert_der(&self) -> Vec<u8> {
        self.cert.der().as_ref().to_vec()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Issue a server certificate with subject alternative names for every
    /// host/IP the relay is reachable at.
    pub fn issue_server(&self, hosts: &[String]) -> Result<IssuedCert, IdentityError> {
        let key = KeyPair::generate()?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{} relay", self.fleet_tag));
        dn.push(DnType::OrganizationName, self.fleet_tag.clone());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
        for host in hosts {
            let san = match host.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(
                    host.clone()
                        .try_into()
                        .map_err(|_| IdentityError::Pem(format!("invalid SAN host: {}", host)))?,
                ),
            };
            params.subject_alt_names.push(san);
        }

        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().as_ref().to_vec(),
        })
    }

    /// Issue a node (client) certificate. The Common Name is the node id;
    /// the relay derives the authenticated identity from it.
    pub fn issue_node(&self, node_id: &str) -> Result<IssuedCert, IdentityError> {
        let key = KeyPair::generate()?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_id);
        dn.push(DnType::OrganizationName, self.fleet_tag.clone());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().as_ref().to_vec(),
        })
    }
}

/// 128-bit random certificate serial.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Clear the top bit so the DER integer stays positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Verifies presented peer certificates against one configured CA.
pub struct CertificateVerifier {
    ca_der: Vec<u8>,
}

impl CertificateVerifier {
    pub fn new(ca_der: Vec<u8>) -> Result<Self, IdentityError> {
        // Fail fast on garbage CA material.
        X509Certificate::from_der(&ca_der).map_err(|e| IdentityError::Parse(e.to_string()))?;
        Ok(Self { ca_der })
    }

    pub fn from_pem(ca_pem: &str) -> Result<Self, IdentityError> {
        let der = pem_to_der(ca_pem)?;
        Self::new(der)
    }

    /// Verify a presented node certificate: it must chain to the CA, be
    /// within its validity window, and carry a non-empty Common Name. The
    /// CN is returned as the authenticated node identity.
    pub fn verify_node_cert(&self, cert_der: &[u8]) -> Result<String, IdentityError> {
        let (_, cert) =
            X509Certificate::from_der(cert_der).map_err(|e| IdentityError::Parse(e.to_string()))?;
        let (_, ca) = X509Certificate::from_der(&self.ca_der)
            .map_err(|e| IdentityError::Parse(e.to_string()))?;

        if !cert.validity().is_valid() {
            return Err(IdentityError::OutsideValidity);
        }
        if cert.issuer() != ca.subject() {
            return Err(IdentityError::UntrustedIssuer);
        }
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|_| IdentityError::BadSignature)?;

        common_name(&cert).ok_or(IdentityError::MissingCommonName)
    }
}

/// Extract the Common Name from a DER certificate without verifying it.
pub fn peer_common_name(cert_der: &[u8]) -> Result<String, IdentityError> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| IdentityError::Parse(e.to_string()))?;
    common_name(&cert).ok_or(IdentityError::MissingCommonName)
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .map(|cn| cn.to_string())
}

/// Constant-time equality for bearer-token comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, IdentityError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| IdentityError::Pem("no certificate found in PEM input".into()))?
        .map_err(|e| IdentityError::Pem(e.to_string()))?;
    Ok(cert.as_ref().to_vec())
}
