//! Default trust anchor providers
//!
//! The platform trust anchors are not a hidden global; the manager is handed
//! a [`DefaultAnchors`] implementation and merges what it yields.

use std::path::PathBuf;

use openssl::nid::Nid;
use openssl::x509::X509;
use tracing::debug;

use super::cert::Certificate;
use super::store::{CredentialStore, Entry, StoreKind};
use super::{Result, SecurityError};

/// Password of the JDK `cacerts` file
pub const CACERTS_PASSWORD: &str = "changeit";

/// Source of platform default trust anchors
pub trait DefaultAnchors: Send + Sync {
    /// Entries keyed by their original alias
    fn anchors(&self) -> Result<Vec<(String, Entry)>>;
}

/// Provider without anchors
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAnchors;

impl DefaultAnchors for NoAnchors {
    fn anchors(&self) -> Result<Vec<(String, Entry)>> {
        Ok(Vec::new())
    }
}

/// A fixed set of entries
#[derive(Debug, Clone, Default)]
pub struct StaticAnchors {
    entries: Vec<(String, Entry)>,
}

impl StaticAnchors {
    pub fn new(entries: Vec<(String, Entry)>) -> Self {
        StaticAnchors { entries }
    }

    pub fn with_certificate(mut self, alias: impl Into<String>, certificate: Certificate) -> Self {
        self.entries
            .push((alias.into(), Entry::TrustedCertificate { certificate }));
        self
    }
}

impl DefaultAnchors for StaticAnchors {
    fn anchors(&self) -> Result<Vec<(String, Entry)>> {
        Ok(self.entries.clone())
    }
}

/// Anchors read from a keystore file such as a JDK `cacerts`
#[derive(Debug, Clone)]
pub struct StoreFileAnchors {
    path: PathBuf,
    password: String,
}

impl StoreFileAnchors {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_password(path, CACERTS_PASSWORD)
    }

    pub fn with_password(path: impl Into<PathBuf>, password: &str) -> Self {
        StoreFileAnchors {
            path: path.into(),
            password: password.to_string(),
        }
    }

    /// `$JAVA_HOME/lib/security/cacerts`, when `JAVA_HOME` is set
    pub fn from_java_home() -> Option<Self> {
        let home = std::env::var_os("JAVA_HOME")?;
        Some(Self::new(
            PathBuf::from(home).join("lib").join("security").join("cacerts"),
        ))
    }
}

impl DefaultAnchors for StoreFileAnchors {
    fn anchors(&self) -> Result<Vec<(String, Entry)>> {
        let bytes = std::fs::read(&self.path)?;
        let store = CredentialStore::parse(StoreKind::Trust, &bytes, &self.password, None)?;
        debug!(
            "read {} default anchors from {}",
            store.len(),
            self.path.display()
        );
        Ok(store
            .entries()
            .map(|(alias, entry)| (alias.to_string(), entry.clone()))
            .collect())
    }
}

/// Anchors read from a PEM bundle such as `/etc/ssl/certs/ca-certificates.crt`
///
/// Aliases are the lowercased subject common name, or the position in the
/// bundle when there is none. Repeated names get a numeric suffix.
#[derive(Debug, Clone)]
pub struct PemBundleAnchors {
    path: PathBuf,
}

impl PemBundleAnchors {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PemBundleAnchors { path: path.into() }
    }

    /// `SSL_CERT_FILE`, else the first bundle found at a common distribution path
    pub fn system() -> Self {
        let probe = probe_bundle().unwrap_or_else(|| PathBuf::from("/etc/ssl/cert.pem"));
        Self::new(probe)
    }
}

fn probe_bundle() -> Option<PathBuf> {
    if let Some(file) = std::env::var_os("SSL_CERT_FILE") {
        return Some(PathBuf::from(file));
    }
    [
        "/etc/ssl/certs/ca-certificates.crt",
        "/etc/pki/tls/certs/ca-bundle.crt",
        "/etc/ssl/cert.pem",
    ]
    .into_iter()
    .map(PathBuf::from)
    .find(|path| path.is_file())
}

impl DefaultAnchors for PemBundleAnchors {
    fn anchors(&self) -> Result<Vec<(String, Entry)>> {
        let bytes = std::fs::read(&self.path)?;
        let certs = X509::stack_from_pem(&bytes)?;
        if certs.is_empty() {
            return Err(SecurityError::InvalidPem(format!(
                "no certificates in {}",
                self.path.display()
            )));
        }

        let mut entries: Vec<(String, Entry)> = Vec::with_capacity(certs.len());
        for (index, cert) in certs.into_iter().enumerate() {
            let base = cert
                .subject_name()
                .entries_by_nid(Nid::COMMONNAME)
                .next()
                .and_then(|cn| cn.data().as_utf8().ok())
                .map(|cn| cn.to_lowercase())
                .unwrap_or_else(|| index.to_string());

            let mut alias = base.clone();
            let mut n = 1;
            while entries.iter().any(|(a, _)| *a == alias) {
                n += 1;
                alias = format!("{} {}", base, n);
            }

            entries.push((
                alias,
                Entry::TrustedCertificate {
                    certificate: Certificate::from_x509(cert)?,
                },
            ));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA_PEM: &str = include_str!("../../tests/fixtures/ca.pem");
    const EXAMPLE_PEM: &str = include_str!("../../tests/fixtures/example.pem");

    #[test]
    fn test_no_anchors() {
        assert!(NoAnchors.anchors().unwrap().is_empty());
    }

    #[test]
    fn test_static_anchors() {
        let anchors = StaticAnchors::default()
            .with_certificate("ca", Certificate::from_pem(CA_PEM).unwrap())
            .anchors()
            .unwrap();
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].0, "ca");
    }

    #[test]
    fn test_store_file_anchors() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/cacerts.jks");
        let mut aliases: Vec<String> = StoreFileAnchors::new(path)
            .anchors()
            .unwrap()
            .into_iter()
            .map(|(alias, _)| alias)
            .collect();
        aliases.sort();
        assert_eq!(aliases, vec!["stray-key", "test-ca"]);

        assert!(StoreFileAnchors::with_password(path, "wrong").anchors().is_err());
        assert!(StoreFileAnchors::new("/nonexistent/cacerts").anchors().is_err());
    }

    #[test]
    fn test_pem_bundle_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle.pem");
        std::fs::write(&bundle, format!("{}{}{}", CA_PEM, EXAMPLE_PEM, CA_PEM)).unwrap();

        let anchors = PemBundleAnchors::new(&bundle).anchors().unwrap();
        let aliases: Vec<&str> = anchors.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(
            aliases,
            vec!["credstore test ca", "example.com", "credstore test ca 2"]
        );

        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();
        assert!(PemBundleAnchors::new(&empty).anchors().is_err());
    }
}
