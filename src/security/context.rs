//! Trust context construction
//!
//! [`TrustContextBuilder`] turns an identity store, a [`TrustPolicy`] and a
//! [`ClientAliasResolver`] into a [`TlsContext`]. OpenSSL picks the client
//! certificate per context, so one context is prepared for every private key
//! alias plus one without a certificate; [`TlsContext::connect`] asks the
//! resolver which one a destination gets.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::Arc;

use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode};
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509CheckFlags;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::cert::{trace_certificate, Certificate};
use super::inspect::PeerChainReport;
use super::manager::CredentialStoreManager;
use super::resolver::{ClientAliasResolver, Destination};
use super::store::CredentialStore;
use super::{Result, SecurityError};

/// Where trust anchors come from
#[derive(Debug, Clone)]
pub enum TrustPolicy {
    /// Accept every peer chain. Insecure, for tests and debugging only.
    TrustAll,
    /// The identity store doubles as trust anchors
    IdentityStore,
    /// A separate trust store
    DedicatedStore(Arc<CredentialStore>),
}

/// [`TrustPolicy`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustPolicyKind {
    TrustAll,
    IdentityStore,
    DedicatedStore,
}

impl TrustPolicy {
    pub fn kind(&self) -> TrustPolicyKind {
        match self {
            TrustPolicy::TrustAll => TrustPolicyKind::TrustAll,
            TrustPolicy::IdentityStore => TrustPolicyKind::IdentityStore,
            TrustPolicy::DedicatedStore(_) => TrustPolicyKind::DedicatedStore,
        }
    }
}

/// How the peer certificate is matched against the destination host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostnameCheck {
    /// OpenSSL host name verification
    Default,
    /// No host name verification
    Noop,
    /// No host name verification, but log a peer chain report per handshake
    #[default]
    Logging,
}

pub struct TrustContextBuilder {
    identity: Arc<CredentialStore>,
    key_password: String,
    policy: TrustPolicy,
    resolver: Arc<ClientAliasResolver>,
    hostname_check: HostnameCheck,
    diagnostics: Option<Arc<CredentialStoreManager>>,
}

impl TrustContextBuilder {
    /// Start from the identity store and its key password
    ///
    /// The policy defaults to [`TrustPolicy::IdentityStore`] and the resolver
    /// to the default base alias.
    pub fn new(identity: Arc<CredentialStore>, key_password: &str) -> Self {
        TrustContextBuilder {
            identity,
            key_password: key_password.to_string(),
            policy: TrustPolicy::IdentityStore,
            resolver: Arc::new(ClientAliasResolver::default()),
            hostname_check: HostnameCheck::default(),
            diagnostics: None,
        }
    }

    pub fn trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn resolver(mut self, resolver: Arc<ClientAliasResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn hostname_check(mut self, check: HostnameCheck) -> Self {
        self.hostname_check = check;
        self
    }

    /// Manager used to name certificates in peer chain reports
    pub fn diagnostics(mut self, manager: Arc<CredentialStoreManager>) -> Self {
        self.diagnostics = Some(manager);
        self
    }

    fn anchors(&self) -> Vec<X509> {
        let store = match &self.policy {
            TrustPolicy::TrustAll => return Vec::new(),
            TrustPolicy::IdentityStore => &self.identity,
            TrustPolicy::DedicatedStore(store) => store,
        };

        let anchors: Vec<X509> = store
            .entries()
            .filter_map(|(_, entry)| entry.certificate())
            .map(|cert| cert.x509().clone())
            .collect();
        if anchors.is_empty() {
            warn!(
                "{} has no certificates, no peer will be trusted",
                store.kind()
            );
        }
        anchors
    }

    fn trust_store(anchors: &[X509]) -> Result<X509Store> {
        let mut builder = X509StoreBuilder::new()?;
        for anchor in anchors {
            if let Err(e) = builder.add_cert(anchor.clone()) {
                debug!("trust anchor not added: {}", e);
            }
        }
        Ok(builder.build())
    }

    fn base_context(&self, anchors: &[X509]) -> Result<SslContextBuilder> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;
        match self.policy {
            TrustPolicy::TrustAll => builder.set_verify(SslVerifyMode::NONE),
            _ => {
                builder.set_verify(SslVerifyMode::PEER);
                builder.set_cert_store(Self::trust_store(anchors)?);
            }
        }
        Ok(builder)
    }

    fn identity_context(&self, alias: &str, anchors: &[X509]) -> Result<SslContext> {
        let key = self.identity.private_key(alias, &self.key_password)?;
        let chain: &[Certificate] = self
            .identity
            .entry(alias)
            .map(|entry| entry.chain())
            .unwrap_or_default();
        let (leaf, intermediates) = chain.split_first().ok_or_else(|| {
            SecurityError::InvalidConfig(format!("key entry '{}' has no certificate", alias))
        })?;

        let mut builder = self.base_context(anchors)?;
        builder.set_certificate(leaf.x509())?;
        builder.set_private_key(&key)?;
        for cert in intermediates {
            builder.add_extra_chain_cert(cert.x509().clone())?;
        }
        builder.check_private_key()?;

        trace_certificate(leaf.x509(), false);
        Ok(builder.build())
    }

    /// Build the context, reporting why it could not be built
    pub fn try_build(self) -> Result<TlsContext> {
        let kind = self.policy.kind();
        if kind == TrustPolicyKind::TrustAll {
            warn!("INSECURE: TLS context trusts every peer certificate, never use this in production");
        }

        let anchors = self.anchors();
        let mut identities = HashMap::new();
        for alias in self.identity.key_aliases() {
            let context = self.identity_context(&alias, &anchors).map_err(|e| {
                error!("can't load key material for alias '{}': {}", alias, e);
                e
            })?;
            identities.insert(alias, context);
        }
        let anonymous = self.base_context(&anchors)?.build();

        debug!(
            "TLS context built: policy {:?}, {} anchors, {} client identities",
            kind,
            anchors.len(),
            identities.len()
        );

        Ok(TlsContext {
            policy: kind,
            hostname_check: self.hostname_check,
            resolver: self.resolver,
            identities,
            anonymous,
            diagnostics: self.diagnostics,
        })
    }

    /// Build the context; `None` when key material can't be loaded
    pub fn build(self) -> Option<TlsContext> {
        match self.try_build() {
            Ok(context) => Some(context),
            Err(e) => {
                error!("no TLS context: {}", e);
                None
            }
        }
    }
}

/// Client side TLS context of one HTTP client configuration
pub struct TlsContext {
    policy: TrustPolicyKind,
    hostname_check: HostnameCheck,
    resolver: Arc<ClientAliasResolver>,
    identities: HashMap<String, SslContext>,
    anonymous: SslContext,
    diagnostics: Option<Arc<CredentialStoreManager>>,
}

impl TlsContext {
    /// Whether peers are accepted without verification
    pub fn is_trust_all(&self) -> bool {
        self.policy == TrustPolicyKind::TrustAll
    }

    pub fn policy_kind(&self) -> TrustPolicyKind {
        self.policy
    }

    pub fn hostname_check(&self) -> HostnameCheck {
        self.hostname_check
    }

    /// Aliases with a prepared client identity
    pub fn identity_aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.identities.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }

    /// Alias whose certificate is presented to `destination`
    pub fn client_alias(&self, destination: &Destination) -> Option<String> {
        self.resolver.resolve(destination, self.identities.keys())
    }

    /// Run the client handshake over `stream`
    pub fn connect<S>(&self, destination: &Destination, stream: S) -> Result<SslStream<S>>
    where
        S: Read + Write + fmt::Debug,
    {
        let alias = self.client_alias(destination);
        let context = alias
            .as_deref()
            .and_then(|alias| self.identities.get(alias))
            .unwrap_or(&self.anonymous);

        let mut ssl = Ssl::new(context)?;
        let host = destination.host();
        let ip = host.parse::<IpAddr>().ok();
        if ip.is_none() {
            ssl.set_hostname(host)?;
        }
        if self.hostname_check == HostnameCheck::Default && !self.is_trust_all() {
            let param = ssl.param_mut();
            match ip {
                Some(ip) => param.set_ip(ip)?,
                None => {
                    param.set_hostflags(X509CheckFlags::NO_PARTIAL_WILDCARDS);
                    param.set_host(host)?;
                }
            }
        }

        let stream = ssl.connect(stream).map_err(|e| {
            warn!("TLS handshake with {} failed: {}", destination, e);
            SecurityError::HandshakeFailed(format!("{}: {}", destination, e))
        })?;

        if self.hostname_check == HostnameCheck::Logging {
            PeerChainReport::from_ssl(stream.ssl(), self.diagnostics.as_deref()).log();
        }
        Ok(stream)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("policy", &self.policy)
            .field("hostname_check", &self.hostname_check)
            .field("identities", &self.identity_aliases())
            .finish_non_exhaustive()
    }
}
