//! Root CA for TLS interception.
//!
//! The proxy signs a leaf certificate per intercepted host with this CA.
//! Clients must trust it; the certificate probe host exists so a client can
//! check that they do.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

const CA_CERT_FILENAME: &str = "warden-ca.crt";
const CA_KEY_FILENAME: &str = "warden-ca.key";
const CA_COMMON_NAME: &str = "Warden Root CA";

/// Leaf certificates kept in the authority's cache.
const LEAF_CACHE_SIZE: u64 = 1000;

/// Manages the root CA certificate on disk.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// CA manager in the platform data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("org", "warden", "Warden")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Uses `ca_dir` when set, otherwise the platform data directory.
    pub fn from_config(ca_dir: Option<&Path>) -> Result<Self, CaManagerError> {
        match ca_dir {
            Some(dir) => Ok(Self::new(dir)),
            None => Self::with_default_dir(),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA, generating it first if it is missing.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root certificate and key, replacing any on disk.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;
        let cert = ca_params()?
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        write_private(&self.key_path(), &key_pair.serialize_pem())?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Creates the hudsucker authority from the files on disk.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, LEAF_CACHE_SIZE, default_provider()))
    }

    /// The CA certificate as DER, for installing on clients.
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let pem = pem::parse(cert_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        if pem.tag() != "CERTIFICATE" {
            return Err(CaManagerError::Parse(format!(
                "expected a CERTIFICATE block, found {}",
                pem.tag()
            )));
        }
        Ok(pem.into_contents())
    }
}

/// Writes the CA key readable by its owner only.
#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<(), CaManagerError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| CaManagerError::Write(e.to_string()))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| CaManagerError::Write(e.to_string()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<(), CaManagerError> {
    fs::write(path, contents).map_err(|e| CaManagerError::Write(e.to_string()))
}

fn ca_params() -> Result<CertificateParams, CaManagerError> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| CaManagerError::Generation(e.to_string()))?;

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, CA_COMMON_NAME);
    name.push(DnType::OrganizationName, "Warden");
    params.distinguished_name = name;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    Ok(params)
}
