//! Store and client TLS configuration
//!
//! Both argument sets deserialize from the camelCase JSON used by the client
//! configuration files. Secrets are accepted on input but never serialized,
//! so dumping the arguments cannot leak them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::context::{HostnameCheck, TrustPolicy};
use super::manager::CredentialStoreManager;
use super::resolver::{ClientAliasResolver, DEFAULT_BASE_ALIAS, DEFAULT_SEPARATOR};
use super::store::{StoreFormat, StoreKind};
use super::{Result, SecurityError};
use crate::resource::ResourceLoader;

pub const PROP_TRUSTSTORE_FILE: &str = "security.truststore.file";
pub const PROP_TRUSTSTORE_PASSWORD: &str = "security.truststore.storepwd";
pub const PROP_KEYSTORE_FILE: &str = "security.keystore.file";
pub const PROP_KEYSTORE_PASSWORD: &str = "security.keystore.storepwd";
pub const PROP_KEYSTORE_KEY_PASSWORD: &str = "security.keystore.keypwd";

/// Command line flag enabling verbose certificate tracing
pub const TRACE_FLAG: &str = "--trace";

/// Where and how to load the credential stores
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreArgs {
    pub truststore_type: Option<String>,
    pub truststore: Option<String>,
    #[serde(skip_serializing)]
    pub truststore_secret: Option<String>,
    pub keystore_type: Option<String>,
    pub keystore: Option<String>,
    #[serde(skip_serializing)]
    pub keystore_secret: Option<String>,
    #[serde(skip_serializing)]
    pub keystore_key_secret: Option<String>,
    /// Merge the platform default anchors into the trust store
    pub include_jdk_certificate: bool,
    /// Try store names as filesystem paths when no resource matches
    pub allow_filesystem_lookup: bool,
    pub debug_mode: bool,
}

/// One store to load, resolved from [`StoreArgs`]
#[derive(Clone, PartialEq, Eq)]
pub struct StoreSource {
    pub kind: StoreKind,
    pub name: String,
    pub password: String,
    pub format: Option<StoreFormat>,
}

impl fmt::Debug for StoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSource")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl StoreArgs {
    pub fn keystore(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.keystore = Some(name.into());
        self.keystore_secret = Some(secret.into());
        self
    }

    pub fn keystore_key_secret(mut self, secret: impl Into<String>) -> Self {
        self.keystore_key_secret = Some(secret.into());
        self
    }

    pub fn keystore_type(mut self, store_type: impl Into<String>) -> Self {
        self.keystore_type = Some(store_type.into());
        self
    }

    pub fn truststore(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.truststore = Some(name.into());
        self.truststore_secret = Some(secret.into());
        self
    }

    pub fn truststore_type(mut self, store_type: impl Into<String>) -> Self {
        self.truststore_type = Some(store_type.into());
        self
    }

    pub fn include_jdk_certificate(mut self, include: bool) -> Self {
        self.include_jdk_certificate = include;
        self
    }

    pub fn allow_filesystem_lookup(mut self, allow: bool) -> Self {
        self.allow_filesystem_lookup = allow;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    /// Read arguments from a JSON resource
    pub fn try_from_config(name: &str, loader: &ResourceLoader) -> Result<Self> {
        let bytes = loader
            .open(name, true, true)
            .ok_or_else(|| SecurityError::InvalidConfig(format!("'{}' not found", name)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read arguments from a JSON resource, falling back to the defaults
    pub fn from_config(name: &str, loader: &ResourceLoader) -> Self {
        Self::try_from_config(name, loader).unwrap_or_else(|e| {
            error!("can't read store arguments from '{}': {}", name, e);
            Self::default()
        })
    }

    /// Overlay the `security.*` properties present in `properties`
    pub fn with_properties(mut self, properties: &HashMap<String, String>) -> Self {
        let get = |key: &str| properties.get(key).cloned();

        if let Some(file) = get(PROP_TRUSTSTORE_FILE) {
            self.truststore = Some(file);
        }
        if let Some(secret) = get(PROP_TRUSTSTORE_PASSWORD) {
            self.truststore_secret = Some(secret);
        }
        if let Some(file) = get(PROP_KEYSTORE_FILE) {
            self.keystore = Some(file);
        }
        if let Some(secret) = get(PROP_KEYSTORE_PASSWORD) {
            self.keystore_secret = Some(secret);
        }
        if let Some(secret) = get(PROP_KEYSTORE_KEY_PASSWORD) {
            self.keystore_key_secret = Some(secret);
        }
        self
    }

    /// Turn on debug mode when `--trace` is among `args`
    pub fn with_cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if args.into_iter().any(|arg| arg.as_ref() == TRACE_FLAG) {
            self.debug_mode = true;
        }
        self
    }

    /// Key password of the identity store; the store password when unset
    pub fn key_password(&self) -> String {
        self.keystore_key_secret
            .clone()
            .or_else(|| self.keystore_secret.clone())
            .unwrap_or_default()
    }

    pub fn identity_source(&self) -> StoreSource {
        StoreSource {
            kind: StoreKind::Identity,
            name: self.keystore.clone().unwrap_or_default(),
            password: self.keystore_secret.clone().unwrap_or_default(),
            format: parse_format(StoreKind::Identity, self.keystore_type.as_deref()),
        }
    }

    pub fn trust_source(&self) -> StoreSource {
        StoreSource {
            kind: StoreKind::Trust,
            name: self.truststore.clone().unwrap_or_default(),
            password: self.truststore_secret.clone().unwrap_or_default(),
            format: parse_format(StoreKind::Trust, self.truststore_type.as_deref()),
        }
    }
}

fn parse_format(kind: StoreKind, name: Option<&str>) -> Option<StoreFormat> {
    let name = name.filter(|n| !n.trim().is_empty())?;
    let format = StoreFormat::from_name(name);
    if format.is_none() {
        warn!("unknown {} type '{}', detecting from content", kind, name);
    }
    format
}

impl fmt::Debug for StoreArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("StoreArgs")
            .field("truststore_type", &self.truststore_type)
            .field("truststore", &self.truststore)
            .field("truststore_secret", &redact(&self.truststore_secret))
            .field("keystore_type", &self.keystore_type)
            .field("keystore", &self.keystore)
            .field("keystore_secret", &redact(&self.keystore_secret))
            .field("keystore_key_secret", &redact(&self.keystore_key_secret))
            .field("include_jdk_certificate", &self.include_jdk_certificate)
            .field("allow_filesystem_lookup", &self.allow_filesystem_lookup)
            .field("debug_mode", &self.debug_mode)
            .finish()
    }
}

/// Client side TLS options of one HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientTlsArgs {
    /// Base alias of the client certificate
    pub client_cert_alias: String,
    /// Joins the base alias and a host suffix
    pub alias_separator: String,
    pub hostname_verifier: HostnameCheck,
    /// Use the identity store as trust anchors
    pub keystore_contains_certificates: bool,
    /// Accept any server certificate. Insecure.
    pub trust_all: bool,
}

impl Default for ClientTlsArgs {
    fn default() -> Self {
        ClientTlsArgs {
            client_cert_alias: DEFAULT_BASE_ALIAS.to_string(),
            alias_separator: DEFAULT_SEPARATOR.to_string(),
            hostname_verifier: HostnameCheck::default(),
            keystore_contains_certificates: false,
            trust_all: false,
        }
    }
}

impl ClientTlsArgs {
    /// Trust policy selected by the flags; `trust_all` wins
    pub fn trust_policy(&self, manager: &CredentialStoreManager) -> TrustPolicy {
        if self.trust_all {
            TrustPolicy::TrustAll
        } else if self.keystore_contains_certificates {
            TrustPolicy::IdentityStore
        } else {
            TrustPolicy::DedicatedStore(manager.trust_store())
        }
    }

    /// A fresh resolver for the configured alias scheme
    pub fn resolver(&self) -> ClientAliasResolver {
        ClientAliasResolver::with_separator(&self.client_cert_alias, &self.alias_separator)
    }
}
