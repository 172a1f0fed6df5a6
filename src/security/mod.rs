//! Credential stores and trust contexts
//!
//! This module equips an HTTP client with mutual-TLS identity and trust
//! management on top of OpenSSL.
//!
//! # Architecture
//!
//! 1. [`cert`] and [`pem`] hold stateless certificate helpers (thumbprints,
//!    self-signed test, alternative names, summaries, PEM conversions)
//! 2. [`store`] reads credential stores (JKS, JCEKS and PKCS#12) into
//!    [`CredentialStore`] values
//! 3. [`CredentialStoreManager`] owns the identity store and the trust store,
//!    merges platform trust anchors and answers alias/issuer lookups
//! 4. [`ClientAliasResolver`] picks the client certificate alias per
//!    destination and caches the decision
//! 5. [`TrustContextBuilder`] composes the above into a [`TlsContext`]
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::sync::Arc;
//! use credstore::resource::ResourceLoader;
//! use credstore::security::{
//!     ClientAliasResolver, CredentialStoreManager, Destination, NoAnchors, StoreArgs,
//!     TrustContextBuilder, TrustPolicy,
//! };
//!
//! let args = StoreArgs::default()
//!     .keystore("certs/identity.jks", "storepass")
//!     .keystore_key_secret("keypass")
//!     .truststore("certs/trust.jks", "trustpass");
//! let manager = CredentialStoreManager::load(args, &ResourceLoader::new().with_root("."), &NoAnchors);
//!
//! let resolver = Arc::new(ClientAliasResolver::new("authz_rpc"));
//! let context = TrustContextBuilder::new(manager.identity_store(), manager.key_password())
//!     .trust_policy(TrustPolicy::DedicatedStore(manager.trust_store()))
//!     .resolver(resolver)
//!     .build()
//!     .expect("no TLS context");
//!
//! let destination = Destination::new("api.example.com", 443);
//! let tcp = TcpStream::connect(destination.to_string()).unwrap();
//! let tls = context.connect(&destination, tcp).unwrap();
//! ```

pub mod anchors;
pub mod args;
pub mod cert;
pub mod context;
pub mod error;
pub mod inspect;
pub mod manager;
pub mod pem;
pub mod resolver;
pub mod store;

pub use anchors::{DefaultAnchors, NoAnchors, PemBundleAnchors, StaticAnchors, StoreFileAnchors};
pub use args::{ClientTlsArgs, StoreArgs, StoreSource};
pub use cert::{CertSummary, Certificate, SelfSigned};
pub use context::{HostnameCheck, TlsContext, TrustContextBuilder, TrustPolicy, TrustPolicyKind};
pub use error::SecurityError;
pub use inspect::PeerChainReport;
pub use manager::{CredentialStoreManager, EntrySource};
pub use resolver::{ClientAliasResolver, Destination};
pub use store::{CredentialStore, Entry, ProtectedKey, StoreFormat, StoreKind};

/// Result type for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;
