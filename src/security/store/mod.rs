//! Credential stores
//!
//! A [`CredentialStore`] is the in-memory form of a keystore file: a map from
//! alias to [`Entry`]. Stores are read from three formats, told apart by the
//! first four bytes of the source:
//!
//! - `FE ED FE ED` - JKS
//! - `CE CE CE CE` - JCEKS
//! - anything else - PKCS#12, the platform default
//!
//! Private keys are kept protected ([`ProtectedKey`]) and only unlocked with a
//! key password on demand.

pub mod jks;
pub mod pkcs12;

use std::collections::BTreeMap;
use std::fmt;

use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::symm::Cipher;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::cert::{hexify, Certificate};
use super::{Result, SecurityError};
use crate::resource::ResourceLoader;

/// Role of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Private keys and their chains, presented as our identity
    Identity,
    /// Certificates of parties we trust
    Trust,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Identity => "keystore",
            StoreKind::Trust => "truststore",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary store format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreFormat {
    Jks,
    Jceks,
    Pkcs12,
}

/// Result of format detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// Format used to parse the source
    pub format: StoreFormat,
    /// An explicit format was given and disagrees with `format`
    pub conflict: bool,
}

impl StoreFormat {
    /// Format assumed when the header matches no known magic
    pub const DEFAULT: StoreFormat = StoreFormat::Pkcs12;

    pub const JKS_MAGIC: [u8; 4] = [0xFE, 0xED, 0xFE, 0xED];
    pub const JCEKS_MAGIC: [u8; 4] = [0xCE, 0xCE, 0xCE, 0xCE];

    /// Map a 4-byte header onto one of the legacy formats
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        match header.get(..4)? {
            h if h == Self::JKS_MAGIC => Some(StoreFormat::Jks),
            h if h == Self::JCEKS_MAGIC => Some(StoreFormat::Jceks),
            _ => None,
        }
    }

    /// Parse a type name as used in configuration (`JKS`, `JCEKS`, `PKCS12`)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "JKS" => Some(StoreFormat::Jks),
            "JCEKS" => Some(StoreFormat::Jceks),
            "PKCS12" | "P12" | "PFX" => Some(StoreFormat::Pkcs12),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreFormat::Jks => "JKS",
            StoreFormat::Jceks => "JCEKS",
            StoreFormat::Pkcs12 => "PKCS12",
        }
    }

    /// Pick the format for a source from its header
    ///
    /// The header decides; an unknown header means [`StoreFormat::DEFAULT`].
    /// A conflicting `explicit` format is reported with a warning and
    /// otherwise ignored.
    pub fn detect(header: &[u8], explicit: Option<StoreFormat>) -> Detection {
        let format = match Self::from_magic(header) {
            Some(format) => format,
            None => {
                if header.len() >= 4 {
                    debug!(
                        "unknown store header '{}' (JKS={}; JCEKS={}), assuming {}",
                        hexify(&header[..4]),
                        hexify(&Self::JKS_MAGIC),
                        hexify(&Self::JCEKS_MAGIC),
                        Self::DEFAULT
                    );
                }
                Self::DEFAULT
            }
        };

        let conflict = explicit.is_some_and(|explicit| explicit != format);
        if let (true, Some(explicit)) = (conflict, explicit) {
            warn!(
                "determined store type '{}' differs from store type argument '{}'",
                format, explicit
            );
        }

        Detection { format, conflict }
    }
}

impl fmt::Display for StoreFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A private key in its protected form
#[derive(Clone)]
pub enum ProtectedKey {
    /// Sun JKS key protector blob (`EncryptedPrivateKeyInfo`)
    Jks(Vec<u8>),
    /// JCEKS PBEWithMD5AndTripleDES blob (`EncryptedPrivateKeyInfo`)
    Jceks(Vec<u8>),
    /// PBES2 encrypted PKCS#8
    Pkcs8(Vec<u8>),
    /// Unencrypted PKCS#8, used when the owning password is empty
    Plain(Vec<u8>),
}

impl ProtectedKey {
    /// Protect `key` with `password`
    pub fn seal(key: &PKeyRef<Private>, password: &str) -> Result<Self> {
        if password.is_empty() {
            return Ok(ProtectedKey::Plain(key.private_key_to_pkcs8()?));
        }
        Ok(ProtectedKey::Pkcs8(
            key.private_key_to_pkcs8_passphrase(Cipher::aes_256_cbc(), password.as_bytes())?,
        ))
    }

    /// Recover the key; `alias` only labels the error
    pub fn unlock(&self, alias: &str, password: &str) -> Result<PKey<Private>> {
        match self {
            ProtectedKey::Jks(blob) => jks::recover_jks_key(alias, blob, password),
            ProtectedKey::Jceks(blob) => jks::recover_jceks_key(alias, blob, password),
            ProtectedKey::Pkcs8(der) => {
                PKey::private_key_from_pkcs8_passphrase(der, password.as_bytes())
                    .map_err(|_| SecurityError::UnrecoverableKey(alias.to_string()))
            }
            ProtectedKey::Plain(der) => Ok(PKey::private_key_from_pkcs8(der)?),
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            ProtectedKey::Jks(_) => "jks",
            ProtectedKey::Jceks(_) => "jceks",
            ProtectedKey::Pkcs8(_) => "pkcs8-pbes2",
            ProtectedKey::Plain(_) => "plain",
        }
    }
}

impl fmt::Debug for ProtectedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectedKey({})", self.scheme())
    }
}

/// One store entry
#[derive(Debug, Clone)]
pub enum Entry {
    TrustedCertificate {
        certificate: Certificate,
    },
    PrivateKey {
        key: ProtectedKey,
        /// Leaf first
        chain: Vec<Certificate>,
    },
}

impl Entry {
    /// The trusted certificate, or the leaf of a key entry's chain
    pub fn certificate(&self) -> Option<&Certificate> {
        match self {
            Entry::TrustedCertificate { certificate } => Some(certificate),
            Entry::PrivateKey { chain, .. } => chain.first(),
        }
    }

    pub fn is_trusted_certificate(&self) -> bool {
        matches!(self, Entry::TrustedCertificate { .. })
    }

    pub fn is_private_key(&self) -> bool {
        matches!(self, Entry::PrivateKey { .. })
    }

    pub fn chain(&self) -> &[Certificate] {
        match self {
            Entry::TrustedCertificate { certificate } => std::slice::from_ref(certificate),
            Entry::PrivateKey { chain, .. } => chain,
        }
    }
}

/// A loaded identity or trust store
///
/// Always usable: a store that could not be read is empty, never half
/// populated. The store password is kept for key recovery and never exposed.
#[derive(Clone)]
pub struct CredentialStore {
    kind: StoreKind,
    format: StoreFormat,
    source: Option<String>,
    entries: BTreeMap<String, Entry>,
    password: String,
}

impl CredentialStore {
    /// A valid store without entries
    pub fn empty(kind: StoreKind, format: StoreFormat, password: &str) -> Self {
        CredentialStore {
            kind,
            format,
            source: None,
            entries: BTreeMap::new(),
            password: password.to_string(),
        }
    }

    /// Parse `bytes`, detecting the format from its header
    pub fn parse(
        kind: StoreKind,
        bytes: &[u8],
        password: &str,
        explicit: Option<StoreFormat>,
    ) -> Result<Self> {
        let detection = StoreFormat::detect(bytes, explicit);
        let entries = match detection.format {
            StoreFormat::Jks | StoreFormat::Jceks => jks::read(bytes, password, detection.format)?,
            StoreFormat::Pkcs12 => pkcs12::read(bytes, password)?,
        };

        let mut store = Self::empty(kind, detection.format, password);
        for (alias, entry) in entries {
            store.insert(alias, entry);
        }
        Ok(store)
    }

    /// Load the store named `name` through `loader`
    ///
    /// Never fails: a missing or unreadable source gives an empty store of the
    /// requested kind and the problem is logged.
    pub fn load(
        kind: StoreKind,
        name: &str,
        password: &str,
        explicit: Option<StoreFormat>,
        loader: &ResourceLoader,
        allow_filesystem: bool,
    ) -> Self {
        let fallback_format = explicit.unwrap_or(StoreFormat::DEFAULT);

        if name.trim().is_empty() {
            debug!("no {} configured, using an empty store", kind);
            return Self::empty(kind, fallback_format, password);
        }

        let Some(bytes) = loader.open(name, allow_filesystem, false) else {
            error!("{} '{}' not found, using an empty store", kind, name);
            return Self::empty(kind, fallback_format, password);
        };

        match Self::parse(kind, &bytes, password, explicit) {
            Ok(mut store) => {
                store.source = Some(name.to_string());
                info!(
                    "loaded {} '{}' ({}, {} entries)",
                    kind,
                    name,
                    store.format,
                    store.len()
                );
                store
            }
            Err(e) => {
                error!("loading {} '{}' failed: {}", kind, name, e);
                let mut store = Self::empty(kind, fallback_format, password);
                store.source = Some(name.to_string());
                store
            }
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn format(&self) -> StoreFormat {
        self.format
    }

    /// Name the store was loaded from
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aliases in lexicographic order
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn entry(&self, alias: &str) -> Option<&Entry> {
        self.entries.get(alias)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(alias, entry)| (alias.as_str(), entry))
    }

    pub fn certificate(&self, alias: &str) -> Option<&Certificate> {
        self.entries.get(alias).and_then(Entry::certificate)
    }

    pub fn is_certificate_entry(&self, alias: &str) -> bool {
        self.entries.get(alias).is_some_and(Entry::is_trusted_certificate)
    }

    pub fn is_key_entry(&self, alias: &str) -> bool {
        self.entries.get(alias).is_some_and(Entry::is_private_key)
    }

    /// Aliases of private key entries
    pub fn key_aliases(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_private_key())
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Alias of the first entry whose certificate is byte-identical to `cert`
    pub fn certificate_alias(&self, cert: &Certificate) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.certificate() == Some(cert))
            .map(|(alias, _)| alias.as_str())
    }

    /// Add or replace an entry; replacing is logged
    pub fn insert(&mut self, alias: impl Into<String>, entry: Entry) -> Option<Entry> {
        let alias = alias.into();
        let previous = self.entries.insert(alias.clone(), entry);
        if previous.is_some() {
            warn!("{}: entry '{}' overwritten", self.kind, alias);
        }
        previous
    }

    pub fn remove(&mut self, alias: &str) -> Option<Entry> {
        self.entries.remove(alias)
    }

    /// Unlock the private key stored under `alias`
    pub fn private_key(&self, alias: &str, key_password: &str) -> Result<PKey<Private>> {
        match self.entries.get(alias) {
            Some(Entry::PrivateKey { key, .. }) => key.unlock(alias, key_password),
            Some(Entry::TrustedCertificate { .. }) => Err(SecurityError::Unsupported(format!(
                "'{}' is a certificate entry without a private key",
                alias
            ))),
            None => Err(SecurityError::UnrecoverableKey(alias.to_string())),
        }
    }

    /// Unlock a key with the store password, as done for entries taken from
    /// a temporary store
    pub(crate) fn private_key_with_store_password(&self, alias: &str) -> Result<PKey<Private>> {
        self.private_key(alias, &self.password)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("source", &self.source)
            .field("aliases", &self.entries.keys().collect::<Vec<_>>())
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CERT: &str = include_str!("../../../tests/fixtures/example.pem");
    const EXAMPLE_KEY: &str = include_str!("../../../tests/fixtures/example.pk8.pem");

    fn example_certificate() -> Certificate {
        Certificate::from_pem(EXAMPLE_CERT).unwrap()
    }

    #[test]
    fn test_magic_detection() {
        assert_eq!(StoreFormat::from_magic(&[0xfe, 0xed, 0xfe, 0xed]), Some(StoreFormat::Jks));
        assert_eq!(StoreFormat::from_magic(&[0xce, 0xce, 0xce, 0xce, 0x00]), Some(StoreFormat::Jceks));
        assert_eq!(StoreFormat::from_magic(&[0x30, 0x82, 0x04, 0x18]), None);
        assert_eq!(StoreFormat::from_magic(&[0xfe, 0xed]), None);
    }

    #[test]
    fn test_detect_with_explicit_format() {
        let jks = StoreFormat::detect(&StoreFormat::JKS_MAGIC, None);
        assert_eq!(jks, Detection { format: StoreFormat::Jks, conflict: false });

        let agreeing = StoreFormat::detect(&StoreFormat::JCEKS_MAGIC, Some(StoreFormat::Jceks));
        assert_eq!(agreeing, Detection { format: StoreFormat::Jceks, conflict: false });

        let unknown = StoreFormat::detect(&[1, 2, 3, 4], None);
        assert_eq!(unknown, Detection { format: StoreFormat::DEFAULT, conflict: false });

        // the header wins over a disagreeing argument
        let conflicting = StoreFormat::detect(&[1, 2, 3, 4], Some(StoreFormat::Jks));
        assert_eq!(conflicting, Detection { format: StoreFormat::Pkcs12, conflict: true });
    }

    #[test]
    fn test_format_names() {
        assert_eq!(StoreFormat::from_name("jks"), Some(StoreFormat::Jks));
        assert_eq!(StoreFormat::from_name(" JCEKS "), Some(StoreFormat::Jceks));
        assert_eq!(StoreFormat::from_name("pkcs12"), Some(StoreFormat::Pkcs12));
        assert_eq!(StoreFormat::from_name("bks"), None);
    }

    #[test]
    fn test_insert_overwrites_and_lookups() {
        let mut store = CredentialStore::empty(StoreKind::Trust, StoreFormat::Jks, "secret");
        let cert = example_certificate();

        assert!(store
            .insert("example", Entry::TrustedCertificate { certificate: cert.clone() })
            .is_none());
        assert!(store
            .insert("example", Entry::TrustedCertificate { certificate: cert.clone() })
            .is_some());

        assert_eq!(store.len(), 1);
        assert!(store.is_certificate_entry("example"));
        assert!(!store.is_key_entry("example"));
        assert_eq!(store.certificate_alias(&cert), Some("example"));
        assert!(store.key_aliases().is_empty());
    }

    #[test]
    fn test_sealed_key_unlocks_with_password_only() {
        let key = crate::security::pem::private_key_from_pem(EXAMPLE_KEY).unwrap();
        let sealed = ProtectedKey::seal(&key, "keypass").unwrap();

        let unlocked = sealed.unlock("id", "keypass").unwrap();
        assert!(unlocked.public_eq(&key));
        assert!(matches!(
            sealed.unlock("id", "wrong"),
            Err(SecurityError::UnrecoverableKey(alias)) if alias == "id"
        ));

        let plain = ProtectedKey::seal(&key, "").unwrap();
        assert!(matches!(plain, ProtectedKey::Plain(_)));
        assert!(plain.unlock("id", "").unwrap().public_eq(&key));
    }

    #[test]
    fn test_private_key_lookup() {
        let key = crate::security::pem::private_key_from_pem(EXAMPLE_KEY).unwrap();
        let mut store = CredentialStore::empty(StoreKind::Identity, StoreFormat::Pkcs12, "storepass");
        store.insert(
            "id",
            Entry::PrivateKey {
                key: ProtectedKey::seal(&key, "keypass").unwrap(),
                chain: vec![example_certificate()],
            },
        );

        assert_eq!(store.key_aliases(), vec!["id".to_string()]);
        assert!(store.private_key("id", "keypass").is_ok());
        assert!(store.private_key("id", "storepass").is_err());
        assert!(store.private_key("missing", "keypass").is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let store = CredentialStore::empty(StoreKind::Identity, StoreFormat::Jks, "hunter2");
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_load_missing_source_gives_empty_store() {
        let loader = ResourceLoader::new();
        let store = CredentialStore::load(StoreKind::Trust, "nope.jks", "x", None, &loader, true);
        assert!(store.is_empty());
        assert_eq!(store.kind(), StoreKind::Trust);
        assert_eq!(store.format(), StoreFormat::DEFAULT);

        let unnamed = CredentialStore::load(StoreKind::Identity, "", "", None, &loader, false);
        assert!(unnamed.is_empty());
    }

    #[test]
    fn test_load_garbage_gives_empty_store() {
        let loader = ResourceLoader::new().with_resource("broken.jks", vec![0xfe, 0xed, 0xfe, 0xed, 0, 0]);
        let store = CredentialStore::load(StoreKind::Identity, "broken.jks", "x", None, &loader, false);
        assert!(store.is_empty());
        assert_eq!(store.source(), Some("broken.jks"));
    }
}
