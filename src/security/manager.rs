//! Credential store manager
//!
//! Owns the identity store and the trust store of one client configuration.
//! Both stores sit behind [`ArcSwap`] so handshake threads read a consistent
//! snapshot without locking while the administrative mutators
//! ([`CredentialStoreManager::import_entry`],
//! [`CredentialStoreManager::insert_private_key_from_pem`]) publish a new one.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use itertools::Itertools;
use openssl::base64;
use openssl::pkey::{PKey, Private, Public};
use openssl::x509::X509NameRef;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::anchors::DefaultAnchors;
use super::args::StoreArgs;
use super::cert::{certificate_information, principals_equal, Certificate};
use super::pem;
use super::store::{CredentialStore, Entry, ProtectedKey, StoreFormat, StoreKind};
use super::Result;
use crate::resource::ResourceLoader;

/// Suffix appended to the aliases of merged platform anchors
pub const PLATFORM_ALIAS_SUFFIX: &str = "-jdk";

/// Bytes of a store to import an entry from
#[derive(Debug, Clone, Copy)]
pub enum EntrySource<'a> {
    Raw(&'a [u8]),
    /// Base64 text, line breaks allowed
    Base64(&'a str),
}

impl EntrySource<'_> {
    fn decode(&self) -> Result<Vec<u8>> {
        match self {
            EntrySource::Raw(bytes) => Ok(bytes.to_vec()),
            EntrySource::Base64(text) => {
                let cleaned: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                Ok(base64::decode_block(&cleaned)?)
            }
        }
    }
}

pub struct CredentialStoreManager {
    args: StoreArgs,
    identity: ArcSwap<CredentialStore>,
    trust: ArcSwap<CredentialStore>,
    key_password: String,
    platform_aliases: ArcSwap<Vec<String>>,
    platform_suffix: String,
}

impl CredentialStoreManager {
    /// Load both stores described by `args`
    ///
    /// Never fails. A store that can't be found or read is replaced by an
    /// empty one and the reason is logged.
    pub fn load(args: StoreArgs, loader: &ResourceLoader, anchors: &dyn DefaultAnchors) -> Self {
        debug!(
            "creating credential store manager from arguments: {}",
            serde_json::to_string(&args).unwrap_or_default()
        );

        let allow_fs = args.allow_filesystem_lookup;
        let identity_source = args.identity_source();
        let trust_source = args.trust_source();

        let identity = CredentialStore::load(
            identity_source.kind,
            &identity_source.name,
            &identity_source.password,
            identity_source.format,
            loader,
            allow_fs,
        );
        let trust = CredentialStore::load(
            trust_source.kind,
            &trust_source.name,
            &trust_source.password,
            trust_source.format,
            loader,
            allow_fs,
        );

        let key_password = args.key_password();
        let manager = CredentialStoreManager {
            identity: ArcSwap::from_pointee(identity),
            trust: ArcSwap::from_pointee(trust),
            key_password,
            platform_aliases: ArcSwap::from_pointee(Vec::new()),
            platform_suffix: PLATFORM_ALIAS_SUFFIX.to_string(),
            args,
        };

        if manager.args.include_jdk_certificate {
            manager.merge_platform_anchors(anchors, PLATFORM_ALIAS_SUFFIX);
        }
        if manager.args.debug_mode {
            manager.trace_entries();
        }
        manager
    }

    /// Wrap already loaded stores
    pub fn from_stores(identity: CredentialStore, trust: CredentialStore, key_password: &str) -> Self {
        CredentialStoreManager {
            args: StoreArgs::default(),
            identity: ArcSwap::from_pointee(identity),
            trust: ArcSwap::from_pointee(trust),
            key_password: key_password.to_string(),
            platform_aliases: ArcSwap::from_pointee(Vec::new()),
            platform_suffix: PLATFORM_ALIAS_SUFFIX.to_string(),
        }
    }

    pub fn args(&self) -> &StoreArgs {
        &self.args
    }

    /// Snapshot of the identity store
    pub fn identity_store(&self) -> Arc<CredentialStore> {
        self.identity.load_full()
    }

    /// Snapshot of the trust store
    pub fn trust_store(&self) -> Arc<CredentialStore> {
        self.trust.load_full()
    }

    /// Password protecting the keys of the identity store
    pub fn key_password(&self) -> &str {
        &self.key_password
    }

    fn store(&self, kind: StoreKind) -> Arc<CredentialStore> {
        match kind {
            StoreKind::Identity => self.identity_store(),
            StoreKind::Trust => self.trust_store(),
        }
    }

    /// Copy the certificate entries of `provider` into the trust store as
    /// `<alias><suffix>`
    ///
    /// Other entry kinds are skipped. A provider that fails leaves the trust
    /// store untouched. Returns the number of merged entries.
    pub fn merge_platform_anchors(&self, provider: &dyn DefaultAnchors, suffix: &str) -> usize {
        let anchors = match provider.anchors() {
            Ok(anchors) => anchors,
            Err(e) => {
                warn!("can't load platform trust anchors: {}", e);
                return 0;
            }
        };

        let mut merged = Vec::new();
        let mut certificates = Vec::new();
        for (alias, entry) in anchors {
            if entry.is_trusted_certificate() {
                certificates.push((format!("{}{}", alias, suffix), entry));
                merged.push(alias);
            } else {
                info!("ignore platform anchor entry '{}', not a certificate", alias);
            }
        }

        self.trust.rcu(|current| {
            let mut next = CredentialStore::clone(current);
            for (alias, entry) in &certificates {
                next.insert(alias.clone(), entry.clone());
            }
            next
        });

        let count = merged.len();
        debug!("merged {} platform trust anchors", count);
        self.platform_aliases.store(Arc::new(merged));
        count
    }

    /// Original aliases of the merged platform anchors
    pub fn platform_aliases(&self) -> Vec<String> {
        self.platform_aliases.load().iter().cloned().collect()
    }

    /// Alias of a byte-identical certificate, trust store first
    pub fn find_alias(&self, cert: &Certificate) -> Option<(String, StoreKind)> {
        [StoreKind::Trust, StoreKind::Identity]
            .into_iter()
            .find_map(|kind| {
                self.store(kind)
                    .certificate_alias(cert)
                    .map(|alias| (alias.to_string(), kind))
            })
    }

    /// First trust store certificate issued by `issuer`
    pub fn find_certificate_by_issuer(&self, issuer: &X509NameRef) -> Option<Certificate> {
        self.trust_store()
            .entries()
            .filter_map(|(_, entry)| entry.certificate())
            .find(|cert| principals_equal(cert.x509().issuer_name(), issuer))
            .cloned()
    }

    /// Copy entry `source_alias` of another store into the identity store as
    /// `target_alias`
    ///
    /// Returns `Ok(false)` when the source has no such alias. A key entry is
    /// unlocked with `source_password` and resealed with the key password.
    pub fn try_import_entry(
        &self,
        source: EntrySource<'_>,
        source_password: &str,
        source_alias: &str,
        target_alias: &str,
    ) -> Result<bool> {
        let bytes = source.decode()?;
        let temporary = CredentialStore::parse(
            StoreKind::Identity,
            &bytes,
            source_password,
            Some(StoreFormat::DEFAULT),
        )?;
        info!(
            "temporary imported aliases: {}",
            temporary.aliases().join(";")
        );

        let entry = match temporary.entry(source_alias) {
            None => {
                warn!("can't read entry '{}' from the source store, ignored", source_alias);
                return Ok(false);
            }
            Some(Entry::TrustedCertificate { certificate }) => Entry::TrustedCertificate {
                certificate: certificate.clone(),
            },
            Some(Entry::PrivateKey { chain, .. }) => {
                let key = temporary.private_key_with_store_password(source_alias)?;
                Entry::PrivateKey {
                    key: ProtectedKey::seal(&key, &self.key_password)?,
                    chain: chain.clone(),
                }
            }
        };

        self.insert_identity_entry(target_alias, entry);
        Ok(true)
    }

    /// [`try_import_entry`](Self::try_import_entry), logging failures
    pub fn import_entry(
        &self,
        source: EntrySource<'_>,
        source_password: &str,
        source_alias: &str,
        target_alias: &str,
    ) -> bool {
        self.try_import_entry(source, source_password, source_alias, target_alias)
            .unwrap_or_else(|e| {
                error!("import of entry '{}' failed: {}", source_alias, e);
                false
            })
    }

    /// Store an unencrypted PKCS#8 key and its certificate as `alias`
    pub fn try_insert_private_key_from_pem(
        &self,
        alias: &str,
        key_pem: &str,
        certificate_pem: &str,
    ) -> Result<()> {
        let key = pem::private_key_from_pem(key_pem)?;
        let certificate = Certificate::from_pem(certificate_pem)?;

        let matches = certificate
            .public_key()
            .is_some_and(|public| key.public_eq(&public));
        if !matches {
            warn!("private key for '{}' does not match its certificate", alias);
        }

        let entry = Entry::PrivateKey {
            key: ProtectedKey::seal(&key, &self.key_password)?,
            chain: vec![certificate],
        };
        self.insert_identity_entry(alias, entry);
        Ok(())
    }

    /// [`try_insert_private_key_from_pem`](Self::try_insert_private_key_from_pem),
    /// logging failures; the identity store is untouched on failure
    pub fn insert_private_key_from_pem(&self, alias: &str, key_pem: &str, certificate_pem: &str) -> bool {
        match self.try_insert_private_key_from_pem(alias, key_pem, certificate_pem) {
            Ok(()) => true,
            Err(e) => {
                error!("can't create a private key entry '{}': {}", alias, e);
                false
            }
        }
    }

    fn insert_identity_entry(&self, alias: &str, entry: Entry) {
        self.identity.rcu(|current| {
            let mut next = CredentialStore::clone(current);
            next.insert(alias, entry.clone());
            next
        });
        info!("identity store entry '{}' set", alias);
    }

    /// Certificate of `alias`, identity store first
    pub fn certificate(&self, alias: &str) -> Option<Certificate> {
        [StoreKind::Identity, StoreKind::Trust]
            .into_iter()
            .find_map(|kind| self.store(kind).certificate(alias).cloned())
    }

    pub fn public_key(&self, alias: &str) -> Option<PKey<Public>> {
        self.certificate(alias)?.public_key()
    }

    /// Unlock the identity key `alias`; `password` defaults to the key password
    pub fn try_private_key(&self, alias: &str, password: Option<&str>) -> Result<PKey<Private>> {
        self.identity_store()
            .private_key(alias, password.unwrap_or(&self.key_password))
    }

    pub fn private_key(&self, alias: &str, password: Option<&str>) -> Option<PKey<Private>> {
        match self.try_private_key(alias, password) {
            Ok(key) => Some(key),
            Err(e) => {
                error!(
                    "failed to retrieve private key '{}' from {}: {}",
                    alias,
                    self.identity_store().source().unwrap_or("<no source>"),
                    e
                );
                None
            }
        }
    }

    /// Signature algorithm of the identity certificate `alias`
    pub fn signature_algorithm_name(&self, alias: &str) -> Option<String> {
        self.identity_store()
            .certificate(alias)
            .map(Certificate::signature_algorithm)
    }

    /// Aliases of `kind` joined by `separator`, merged platform anchors left out
    pub fn alias_list(&self, kind: StoreKind, separator: &str) -> String {
        self.store(kind)
            .aliases()
            .filter(|alias| !alias.ends_with(self.platform_suffix.as_str()))
            .join(separator)
    }

    /// Private key aliases of the identity store
    pub fn key_aliases(&self) -> Vec<String> {
        self.identity_store().key_aliases()
    }

    /// JSON overview of sources and aliases, free of secrets
    pub fn describe(&self) -> serde_json::Value {
        let identity = self.identity_store();
        let trust = self.trust_store();
        let aliases = |store: &CredentialStore| -> Vec<String> {
            store
                .aliases()
                .filter(|alias| !alias.ends_with(self.platform_suffix.as_str()))
                .map(str::to_string)
                .collect()
        };

        let mut description = json!({
            "keystore": {
                "sourceName": identity.source().unwrap_or_default(),
                "format": identity.format().as_str(),
                "aliases": aliases(&identity),
            },
            "truststore": {
                "sourceName": trust.source().unwrap_or_default(),
                "format": trust.format().as_str(),
                "aliases": aliases(&trust),
            },
            "filesystemAccess": self.args.allow_filesystem_lookup,
        });

        if self.args.include_jdk_certificate {
            description["platformAnchors"] = json!({
                "aliases": self.platform_aliases(),
                "aliasSuffix": self.platform_suffix,
            });
        }

        json!({ "credentialStoreManager": description })
    }

    fn trace_entries(&self) {
        for kind in [StoreKind::Identity, StoreKind::Trust] {
            let store = self.store(kind);
            for (alias, entry) in store.entries() {
                debug!("{} entry '{}':", kind, alias);
                for line in certificate_information(entry.certificate().map(|c| &**c.x509()), false) {
                    debug!("{}", line);
                }
            }
        }
    }
}

impl fmt::Debug for CredentialStoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStoreManager")
            .field("identity", &*self.identity.load_full())
            .field("trust", &*self.trust.load_full())
            .field("key_password", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CredentialStoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}
