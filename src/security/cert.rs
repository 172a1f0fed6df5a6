//! Certificate analysis
//!
//! Stateless helpers working on single certificates: thumbprints, the
//! self-signed test, alternative names, distinguished name rendering and the
//! human readable summary used for diagnostic logging.

use std::fmt;
use std::sync::OnceLock;

use itertools::Itertools;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{Id, PKey, Public};
use openssl::stack::Stack;
use openssl::x509::{GeneralName, X509NameRef, X509Ref, X509};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{enabled, trace, warn, Level};

use super::{Result, SecurityError};

/// Outcome of the self-signed test
///
/// `Unknown` means the signature could not be checked at all (unsupported
/// algorithm, key type not matching the signature algorithm, provider error);
/// it must not be read as "not self-signed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfSigned {
    True,
    False,
    Unknown,
}

impl SelfSigned {
    /// `Some(bool)` when the outcome is determined
    pub fn known(self) -> Option<bool> {
        match self {
            SelfSigned::True => Some(true),
            SelfSigned::False => Some(false),
            SelfSigned::Unknown => None,
        }
    }
}

impl fmt::Display for SelfSigned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelfSigned::True => "true",
            SelfSigned::False => "false",
            SelfSigned::Unknown => "unknown",
        })
    }
}

/// A parsed certificate together with its DER encoding
///
/// Alternative names and the self-signed outcome are derived on first use and
/// kept for the lifetime of the value.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    der: Vec<u8>,
    self_signed: OnceLock<SelfSigned>,
    subject_alts: OnceLock<Vec<String>>,
    issuer_alts: OnceLock<Vec<String>>,
}

impl Certificate {
    pub fn from_x509(x509: X509) -> Result<Self> {
        let der = x509.to_der()?;
        Ok(Certificate {
            x509,
            der,
            self_signed: OnceLock::new(),
            subject_alts: OnceLock::new(),
            issuer_alts: OnceLock::new(),
        })
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        Self::from_x509(X509::from_der(der)?)
    }

    pub fn from_pem(text: &str) -> Result<Self> {
        Self::from_x509(super::pem::certificate_from_pem(text)?)
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    /// Encoded form, used for byte-exact comparisons and digests
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> String {
        principal_name(self.x509.subject_name())
    }

    pub fn issuer(&self) -> String {
        principal_name(self.x509.issuer_name())
    }

    pub fn public_key(&self) -> Option<PKey<Public>> {
        self.x509.public_key().ok()
    }

    pub fn signature_algorithm(&self) -> String {
        signature_algorithm_name(&self.x509)
    }

    pub fn self_signed(&self) -> SelfSigned {
        *self.self_signed.get_or_init(|| is_self_signed(&self.x509))
    }

    pub fn subject_alt_names(&self) -> &[String] {
        self.subject_alts
            .get_or_init(|| dns_names(self.x509.subject_alt_names()))
    }

    pub fn issuer_alt_names(&self) -> &[String] {
        self.issuer_alts
            .get_or_init(|| dns_names(self.x509.issuer_alt_names()))
    }

    pub fn thumbprint(&self, algorithm: &str) -> Result<String> {
        digest_hex(&self.der, algorithm)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject())
            .field("issuer", &self.issuer())
            .finish()
    }
}

/// Lowercase hex pairs separated by colons (`0b:f7:66`)
pub fn hexify(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).join(":")
}

/// Look up a digest by name; `SHA-1`, `sha1` and `SHA1` are equivalent
pub fn message_digest(algorithm: &str) -> Option<MessageDigest> {
    let normalized = algorithm.replace('-', "").to_ascii_uppercase();
    MessageDigest::from_name(&normalized)
}

/// Digest `bytes` with the named algorithm and render it with [`hexify`]
pub fn digest_hex(bytes: &[u8], algorithm: &str) -> Result<String> {
    let md = message_digest(algorithm)
        .ok_or_else(|| SecurityError::Unsupported(format!("digest algorithm '{}'", algorithm)))?;
    Ok(hexify(&hash(md, bytes)?))
}

/// Thumbprint of the encoded certificate; `<not possible>` when the
/// certificate can't be encoded or the algorithm is unknown
pub fn thumbprint(cert: &X509Ref, algorithm: &str) -> String {
    let digest = cert
        .to_der()
        .map_err(SecurityError::from)
        .and_then(|der| digest_hex(&der, algorithm));

    match digest {
        Ok(hex) => hex,
        Err(e) => {
            warn!("thumbprint with {} failed: {}", algorithm, e);
            "<not possible>".to_string()
        }
    }
}

/// Verify the certificate signature against its own public key
pub fn is_self_signed(cert: &X509Ref) -> SelfSigned {
    let key = match cert.public_key() {
        Ok(key) => key,
        Err(e) => {
            warn!("can't read public key for self-signed test: {}", e);
            return SelfSigned::Unknown;
        }
    };
    verify_outcome(cert.verify(&key))
}

/// Map an OpenSSL verification result onto the tri-state
///
/// OpenSSL reports a signature that does not match with `Ok(false)`; failures
/// to run the check at all surface as an error stack.
pub fn verify_outcome(result: std::result::Result<bool, ErrorStack>) -> SelfSigned {
    match result {
        Ok(true) => SelfSigned::True,
        Ok(false) => {
            // drop the reason left on the thread's error queue
            let _ = ErrorStack::get();
            SelfSigned::False
        }
        Err(e) => {
            warn!("self-signed test undetermined: {}", e);
            SelfSigned::Unknown
        }
    }
}

/// DNS entries (general name type 2) of an alternative names extension
pub fn dns_names(names: Option<Stack<GeneralName>>) -> Vec<String> {
    names
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn subject_alt_dns_names(cert: &X509Ref) -> Vec<String> {
    dns_names(cert.subject_alt_names())
}

pub fn issuer_alt_dns_names(cert: &X509Ref) -> Vec<String> {
    dns_names(cert.issuer_alt_names())
}

/// RFC 2253 style rendering: most specific attribute first, comma separated
pub fn principal_name(name: &X509NameRef) -> String {
    let parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("OID");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| hexify(entry.data().as_slice()));
            format!("{}={}", key, value)
        })
        .collect();
    parts.into_iter().rev().join(",")
}

/// Compare two names the way X.500 principals are compared: same attributes
/// in the same order, values equal ignoring case and surrounding whitespace
pub fn principals_equal(a: &X509NameRef, b: &X509NameRef) -> bool {
    fn canonical(name: &X509NameRef) -> Vec<(i32, String)> {
        name.entries()
            .map(|entry| {
                let value = entry
                    .data()
                    .as_utf8()
                    .map(|s| s.split_whitespace().join(" ").to_lowercase())
                    .unwrap_or_else(|_| hexify(entry.data().as_slice()));
                (entry.object().nid().as_raw(), value)
            })
            .collect()
    }
    canonical(a) == canonical(b)
}

/// Signature algorithm long name, e.g. `sha256WithRSAEncryption`
pub fn signature_algorithm_name(cert: &X509Ref) -> String {
    let nid = cert.signature_algorithm().object().nid();
    nid.long_name()
        .map(str::to_string)
        .unwrap_or_else(|_| cert.signature_algorithm().object().to_string())
}

/// Dotted signature algorithm OID, read with x509-parser
pub fn signature_algorithm_oid(cert: &X509Ref) -> Option<String> {
    let der = cert.to_der().ok()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der).ok()?;
    Some(parsed.signature_algorithm.algorithm.to_id_string())
}

/// ISO-8601 UTC instant, e.g. `2020-01-30T10:03:38Z`
pub fn utc_string(time: &Asn1TimeRef) -> String {
    let rendered = Asn1Time::from_unix(0)
        .and_then(|epoch| epoch.diff(time))
        .ok()
        .map(|diff| i64::from(diff.days) * 86_400 + i64::from(diff.secs))
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .and_then(|instant| instant.format(&Rfc3339).ok());

    rendered.unwrap_or_else(|| time.to_string())
}

/// Type specific facts about a public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFacet {
    Rsa { modulus_bits: u32 },
    Ec { curve: String },
    Other { kind: String, bits: u32 },
}

impl KeyFacet {
    pub fn from_key(key: &PKey<Public>) -> Self {
        let id = key.id();
        if id == Id::RSA {
            KeyFacet::Rsa {
                modulus_bits: key.rsa().map(|r| r.n().num_bits() as u32).unwrap_or(key.bits()),
            }
        } else if id == Id::EC {
            KeyFacet::Ec {
                curve: key
                    .ec_key()
                    .ok()
                    .and_then(|ec| ec.group().curve_name())
                    .and_then(|nid| nid.short_name().ok().map(str::to_string))
                    .unwrap_or_else(|| "<explicit parameters>".to_string()),
            }
        } else {
            let kind = if id == Id::ED25519 {
                "Ed25519".to_string()
            } else if id == Id::ED448 {
                "Ed448".to_string()
            } else if id == Id::DSA {
                "DSA".to_string()
            } else {
                format!("id {}", id.as_raw())
            };
            KeyFacet::Other { kind, bits: key.bits() }
        }
    }

    pub fn class(&self) -> &str {
        match self {
            KeyFacet::Rsa { .. } => "RSA",
            KeyFacet::Ec { .. } => "EC",
            KeyFacet::Other { kind, .. } => kind,
        }
    }
}

/// Certificate facts for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertSummary {
    pub version: i32,
    pub serial: String,
    pub issuer: String,
    pub issuer_alt_names: Vec<String>,
    pub not_before: String,
    pub not_after: String,
    pub subject: String,
    pub subject_alt_names: Vec<String>,
    pub signature_algorithm: String,
    pub signature_oid: Option<String>,
    pub key: Option<KeyFacet>,
    pub self_signed: SelfSigned,
    pub sha1: String,
}

impl CertSummary {
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertSummary {
            version: cert.version() + 1,
            serial: cert
                .serial_number()
                .to_bn()
                .and_then(|bn| bn.to_dec_str().map(|s| s.to_string()))
                .unwrap_or_else(|_| "<undef>".to_string()),
            issuer: principal_name(cert.issuer_name()),
            issuer_alt_names: issuer_alt_dns_names(cert),
            not_before: utc_string(cert.not_before()),
            not_after: utc_string(cert.not_after()),
            subject: principal_name(cert.subject_name()),
            subject_alt_names: subject_alt_dns_names(cert),
            signature_algorithm: signature_algorithm_name(cert),
            signature_oid: signature_algorithm_oid(cert),
            key: cert.public_key().ok().map(|k| KeyFacet::from_key(&k)),
            self_signed: is_self_signed(cert),
            sha1: thumbprint(cert, "SHA-1"),
        }
    }

    /// Ordered, aligned lines for logging
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("  version          : V{}", self.version),
            format!("  serial           : {}", self.serial),
            format!("  issuer           : {}", self.issuer),
        ];
        lines.extend(
            self.issuer_alt_names
                .iter()
                .map(|alt| format!("      alternative  : {}", alt)),
        );
        lines.push(format!(
            "  valid from .. to : {} .. {}",
            self.not_before, self.not_after
        ));
        lines.push(format!("  subject          : {}", self.subject));
        lines.extend(
            self.subject_alt_names
                .iter()
                .map(|alt| format!("      alternative  : {}", alt)),
        );
        lines.push(format!(
            "  algorithm        : {} / OID: {}",
            self.signature_algorithm,
            self.signature_oid.as_deref().unwrap_or("<undef>")
        ));
        match &self.key {
            Some(key) => {
                lines.push(format!("  public key class : {}", key.class()));
                match key {
                    KeyFacet::Rsa { modulus_bits } => {
                        lines.push(format!("  RSA key length   : {}", modulus_bits))
                    }
                    KeyFacet::Ec { curve } => lines.push(format!("  EC params        : {}", curve)),
                    KeyFacet::Other { bits, .. } => {
                        lines.push(format!("  key length       : {}", bits))
                    }
                }
            }
            None => lines.push("  public key class : <unreadable>".to_string()),
        }
        lines.push(format!("  self-signed      : {}", self.self_signed));
        lines.push(format!("  SHA-1            : {}", self.sha1));
        lines
    }
}

/// Summary lines for `cert`, optionally preceded by the PEM text
pub fn certificate_information(cert: Option<&X509Ref>, show_cert: bool) -> Vec<String> {
    let Some(cert) = cert else {
        return vec!["certificate is null".to_string()];
    };

    let mut lines = Vec::new();
    if show_cert {
        if let Ok(pem) = super::pem::certificate_to_pem(cert) {
            lines.extend(pem.lines().map(|l| format!(" {}", l)));
        }
    }
    lines.extend(CertSummary::from_x509(cert).lines());
    lines
}

/// Emit the summary at trace level; nothing is computed when trace is off
pub fn trace_certificate(cert: &X509Ref, show_cert: bool) {
    if enabled!(Level::TRACE) {
        for line in certificate_information(Some(cert), show_cert) {
            trace!("{}", line);
        }
    }
}
