//! Peer chain diagnostics
//!
//! A [`PeerChainReport`] is taken after a handshake on the debug paths. For
//! every certificate the peer sent it records the summary, the self-signed
//! outcome, the alias it is known under and the trust anchors matching its
//! subject and issuer.

use openssl::ssl::{NameType, SslRef};
use tracing::{debug, enabled, Level};

use super::cert::{CertSummary, Certificate, SelfSigned};
use super::manager::CredentialStoreManager;
use super::store::StoreKind;

const UNDEF: &str = "<undef>";

/// One certificate of the peer chain
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub summary: CertSummary,
    pub self_signed: SelfSigned,
    /// Alias of this very certificate
    pub alias: Option<(String, StoreKind)>,
    /// Alias of the first trust anchor issued by this certificate's subject
    pub subject_anchor: Option<(String, StoreKind)>,
    /// Alias of the first trust anchor issued by this certificate's issuer
    pub issuer_anchor: Option<(String, StoreKind)>,
}

impl ChainLink {
    fn new(cert: &Certificate, manager: Option<&CredentialStoreManager>) -> Self {
        let (alias, subject_anchor, issuer_anchor) = match manager {
            Some(manager) => {
                let anchor_alias = |found: Option<Certificate>| {
                    found.and_then(|anchor| manager.find_alias(&anchor))
                };
                (
                    manager.find_alias(cert),
                    anchor_alias(manager.find_certificate_by_issuer(cert.x509().subject_name())),
                    anchor_alias(manager.find_certificate_by_issuer(cert.x509().issuer_name())),
                )
            }
            None => (None, None, None),
        };

        ChainLink {
            summary: CertSummary::from_x509(cert.x509()),
            self_signed: cert.self_signed(),
            alias,
            subject_anchor,
            issuer_anchor,
        }
    }

    /// Whether the certificate or its issuer is known to our stores
    pub fn is_known(&self) -> bool {
        self.alias.is_some() || self.issuer_anchor.is_some()
    }
}

fn describe_alias(found: &Option<(String, StoreKind)>) -> String {
    match found {
        Some((alias, kind)) => format!("alias '{}'  ==  {}", alias, kind),
        None => "alias '<not found>'".to_string(),
    }
}

/// Negotiated parameters and the peer chain of one connection
#[derive(Debug, Clone)]
pub struct PeerChainReport {
    pub version: String,
    pub cipher: String,
    pub servername: Option<String>,
    /// OpenSSL verification outcome of the peer chain
    pub verify_result: String,
    /// Index 0 is the peer certificate
    pub chain: Vec<ChainLink>,
    /// Certificate we presented, if any
    pub local: Option<ChainLink>,
}

impl PeerChainReport {
    /// Report on an established connection
    pub fn from_ssl(ssl: &SslRef, manager: Option<&CredentialStoreManager>) -> Self {
        let chain = ssl
            .peer_cert_chain()
            .map(|stack| {
                stack
                    .iter()
                    .filter_map(|cert| Certificate::from_x509(cert.to_owned()).ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let local = ssl
            .certificate()
            .and_then(|cert| Certificate::from_x509(cert.to_owned()).ok())
            .map(|cert| ChainLink::new(&cert, manager));

        PeerChainReport {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| UNDEF.to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(str::to_string),
            verify_result: ssl.verify_result().error_string().to_string(),
            chain: chain.iter().map(|cert| ChainLink::new(cert, manager)).collect(),
            local,
        }
    }

    /// Report on a chain received out of band
    pub fn from_chain(chain: &[Certificate], manager: Option<&CredentialStoreManager>) -> Self {
        PeerChainReport {
            version: UNDEF.to_string(),
            cipher: UNDEF.to_string(),
            servername: None,
            verify_result: UNDEF.to_string(),
            chain: chain.iter().map(|cert| ChainLink::new(cert, manager)).collect(),
            local: None,
        }
    }

    pub fn peer(&self) -> Option<&ChainLink> {
        self.chain.first()
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("ssl host         : {}", self.servername.as_deref().unwrap_or(UNDEF)),
            format!("ssl protocol     : {}", self.version),
            format!("ssl cipher suite : {}", self.cipher),
            format!("ssl verification : {}", self.verify_result),
        ];

        for (i, link) in self.chain.iter().enumerate() {
            lines.push(format!("ssl[{}] self signed cert : {}", i, link.self_signed));
            lines.push(format!("ssl[{}] chain certificate  ==  {}", i, describe_alias(&link.alias)));
            lines.extend(link.summary.lines());
            lines.push(format!(
                "ssl[{}] subject principal  ==  {}",
                i,
                describe_alias(&link.subject_anchor)
            ));
            lines.push(format!(
                "ssl[{}] issuer principal   ==  {}",
                i,
                describe_alias(&link.issuer_anchor)
            ));
        }

        if let Some(local) = &self.local {
            lines.push(format!("ssl[local]  ==  {}", describe_alias(&local.alias)));
            lines.extend(local.summary.lines());
        }
        lines
    }

    /// Emit the report at debug level
    pub fn log(&self) {
        if enabled!(Level::DEBUG) {
            for line in self.lines() {
                debug!("{}", line);
            }
        }
    }
}
