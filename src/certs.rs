//! Just-in-time server certificate issuance for TLS interception.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{Error, Result};

/// A leaf certificate with its private key, ready to terminate a handshake.
#[derive(Clone)]
pub struct ServerCertificate {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl std::fmt::Debug for ServerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCertificate")
            .field("subject", &self.cert.subject_name())
            .finish()
    }
}

/// Issues leaf certificates signed by a locally-held root CA.
///
/// Issued certificates are cached per subject; the cache is shared by all
/// connections. A service constructed without a root CA fails every
/// issuance with [`Error::MissingRootCertificate`].
pub struct ServerCertificateService {
    root: Option<(X509, PKey<Private>)>,
    cache: Mutex<HashMap<String, ServerCertificate>>,
    cert_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ServerCertificateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCertificateService")
            .field("has_root", &self.root.is_some())
            .field("cert_dir", &self.cert_dir)
            .finish()
    }
}

impl ServerCertificateService {
    /// Loads the root CA from `cert_dir`, generating and saving a new one
    /// if none exists yet.
    pub fn load_or_generate<P: AsRef<Path>>(cert_dir: P) -> Result<Self> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cert_dir)?;

        let cert_path = cert_dir.join("root-ca-cert.pem");
        let key_path = cert_dir.join("root-ca-key.pem");

        let root = if cert_path.exists() && key_path.exists() {
            let cert = X509::from_pem(&fs::read(&cert_path)?)?;
            let key = PKey::private_key_from_pem(&fs::read(&key_path)?)?;
            (cert, key)
        } else {
            let (cert, key) = generate_root_ca()?;
            fs::write(&cert_path, cert.to_pem()?)?;
            fs::write(&key_path, key.private_key_to_pem_pkcs8()?)?;
            (cert, key)
        };

        Ok(Self {
            root: Some(root),
            cache: Mutex::new(HashMap::new()),
            cert_dir: Some(cert_dir),
        })
    }

    /// Builds a service around an already-loaded root CA.
    pub fn from_root(cert: X509, key: PKey<Private>) -> Self {
        Self {
            root: Some((cert, key)),
            cache: Mutex::new(HashMap::new()),
            cert_dir: None,
        }
    }

    /// A service with no root CA; every issuance fails.
    pub fn without_root() -> Self {
        Self {
            root: None,
            cache: Mutex::new(HashMap::new()),
            cert_dir: None,
        }
    }

    /// Issues (or returns a cached) leaf certificate for `subject`.
    pub fn issue_certificate_for(&self, subject: &str) -> Result<ServerCertificate> {
        let (root_cert, root_key) = self
            .root
            .as_ref()
            .ok_or_else(|| Error::MissingRootCertificate("no root CA loaded".to_string()))?;

        if let Some(cached) = self
            .cache
            .lock()
            .expect("certificate cache poisoned")
            .get(subject)
        {
            return Ok(cached.clone());
        }

        let issued = generate_leaf(root_cert, root_key, subject)
            .map_err(|e| Error::CertificateGeneration(e.to_string()))?;

        self.cache
            .lock()
            .expect("certificate cache poisoned")
            .insert(subject.to_string(), issued.clone());

        Ok(issued)
    }

    pub fn root_certificate_pem(&self) -> Result<Vec<u8>> {
        let (cert, _) = self
            .root
            .as_ref()
            .ok_or_else(|| Error::MissingRootCertificate("no root CA loaded".to_string()))?;
        Ok(cert.to_pem()?)
    }

    pub fn cached_certificates(&self) -> usize {
        self.cache.lock().expect("certificate cache poisoned").len()
    }
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn generate_root_ca() -> Result<(X509, PKey<Private>)> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(365 * 10)?.as_ref())?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, "intercept-proxy Root CA")?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "intercept-proxy")?;
    let name = name.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;

    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    builder.sign(&key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

fn generate_leaf(
    root_cert: &X509,
    root_key: &PKey<Private>,
    subject: &str,
) -> Result<ServerCertificate> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, subject)?;
    let name = name.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(root_cert.subject_name())?;
    builder.set_pubkey(&key)?;

    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(root_cert), None))?;
    builder.append_extension(ski)?;
    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .issuer(false)
        .build(&builder.x509v3_context(Some(root_cert), None))?;
    builder.append_extension(aki)?;

    let mut san = SubjectAlternativeName::new();
    if subject.parse::<IpAddr>().is_ok() {
        san.ip(subject);
    } else {
        san.dns(subject);
        if !subject.starts_with("*.") {
            san.dns(&format!("*.{subject}"));
        }
    }
    let san = san.build(&builder.x509v3_context(Some(root_cert), None))?;
    builder.append_extension(san)?;

    builder.sign(root_key, MessageDigest::sha256())?;
    Ok(ServerCertificate {
        cert: builder.build(),
        key,
    })
}
