//! JKS and JCEKS reader
//!
//! Both formats share one layout, all integers big-endian:
//!
//! ```text
//! magic:u32 version:u32 count:u32
//! count * entry
//! sha1(password utf-16be || "Mighty Aphrodite" || everything above)
//! ```
//!
//! Entries start with `tag:u32 alias:utf timestamp:u64`. A key entry (tag 1)
//! carries an `EncryptedPrivateKeyInfo` and a certificate chain, a trusted
//! certificate entry (tag 2) a single certificate. Version 2 stores prefix
//! each certificate with its type name.

use bytes::Buf;
use openssl::hash::{hash, Hasher, MessageDigest};
use openssl::pkey::{PKey, Private};
use openssl::symm::{decrypt, Cipher};
use tracing::{debug, trace};
use x509_parser::der_parser::ber::BerObject;
use x509_parser::der_parser::parse_der;

use super::{Entry, ProtectedKey, StoreFormat};
use crate::security::cert::Certificate;
use crate::security::{Result, SecurityError};

const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERT: u32 = 2;
const TAG_SECRET_KEY: u32 = 3;

const INTEGRITY_SALT: &[u8] = b"Mighty Aphrodite";
const DIGEST_LEN: usize = 20;

/// Sun proprietary key protector
const OID_JKS_KEY_PROTECTOR: &str = "1.3.6.1.4.1.42.2.17.1.1";
/// PBEWithMD5AndTripleDES
const OID_JCEKS_KEY_PROTECTOR: &str = "1.3.6.1.4.1.42.2.19.1";

const X509_TYPE: &str = "X.509";

/// Highest JCEKS key derivation iteration count accepted, as in the JDK
const MAX_JCEKS_ITERATIONS: u32 = 5_000_000;

/// Bounds checked reader over the store body
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(SecurityError::MalformedStore(format!(
                "truncated store reading {} ({} bytes left, {} needed)",
                what,
                self.buf.remaining(),
                n
            )));
        }
        Ok(())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn utf(&mut self, what: &str) -> Result<String> {
        self.need(2, what)?;
        let len = self.buf.get_u16() as usize;
        let raw = self.bytes(len, what)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn block(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u32(what)? as usize;
        self.bytes(len, what)
    }

    fn certificate(&mut self, version: u32) -> Result<Certificate> {
        if version == 2 {
            let cert_type = self.utf("certificate type")?;
            if cert_type != X509_TYPE {
                return Err(SecurityError::Unsupported(format!(
                    "certificate type '{}'",
                    cert_type
                )));
            }
        }
        Certificate::from_der(self.block("certificate")?)
    }
}

/// Read all entries of a JKS or JCEKS store
///
/// The trailing digest is verified with `password`; an empty password skips
/// the check, the way keytool lists a store without one.
pub fn read(bytes: &[u8], password: &str, format: StoreFormat) -> Result<Vec<(String, Entry)>> {
    let mut reader = Reader { buf: bytes };

    let magic = reader.u32("magic")?;
    let expected = match format {
        StoreFormat::Jks => u32::from_be_bytes(StoreFormat::JKS_MAGIC),
        StoreFormat::Jceks => u32::from_be_bytes(StoreFormat::JCEKS_MAGIC),
        StoreFormat::Pkcs12 => {
            return Err(SecurityError::Unsupported(
                "PKCS12 is not a JKS family format".to_string(),
            ))
        }
    };
    if magic != expected {
        return Err(SecurityError::MalformedStore(format!(
            "bad magic {:08x} for {}",
            magic, format
        )));
    }

    let version = reader.u32("version")?;
    if version != 1 && version != 2 {
        return Err(SecurityError::MalformedStore(format!(
            "unsupported store version {}",
            version
        )));
    }

    let count = reader.u32("entry count")?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);

    for _ in 0..count {
        let tag = reader.u32("entry tag")?;
        let alias = reader.utf("alias")?;
        let _created = reader.u64("timestamp")?;

        match tag {
            TAG_PRIVATE_KEY => {
                let blob = reader.block("protected key")?.to_vec();
                let chain_len = reader.u32("chain length")?;
                let chain = (0..chain_len)
                    .map(|_| reader.certificate(version))
                    .collect::<Result<Vec<_>>>()?;

                let key = match format {
                    StoreFormat::Jceks => ProtectedKey::Jceks(blob),
                    _ => ProtectedKey::Jks(blob),
                };
                trace!("key entry '{}' with {} certificates", alias, chain.len());
                entries.push((alias, Entry::PrivateKey { key, chain }));
            }
            TAG_TRUSTED_CERT => {
                let certificate = reader.certificate(version)?;
                trace!("certificate entry '{}'", alias);
                entries.push((alias, Entry::TrustedCertificate { certificate }));
            }
            TAG_SECRET_KEY if format == StoreFormat::Jceks => {
                return Err(SecurityError::Unsupported(format!(
                    "sealed secret key entry '{}'",
                    alias
                )));
            }
            other => {
                return Err(SecurityError::MalformedStore(format!(
                    "unknown entry tag {} for '{}'",
                    other, alias
                )));
            }
        }
    }

    let body_len = bytes.len() - reader.buf.remaining();
    let stored = reader.bytes(DIGEST_LEN, "integrity digest")?;

    if password.is_empty() {
        debug!("no store password, integrity not checked");
    } else {
        let mut hasher = Hasher::new(MessageDigest::sha1())?;
        hasher.update(&utf16_be(password))?;
        hasher.update(INTEGRITY_SALT)?;
        hasher.update(&bytes[..body_len])?;
        if *hasher.finish()? != *stored {
            return Err(SecurityError::Integrity);
        }
    }

    Ok(entries)
}

fn utf16_be(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

fn malformed_key(alias: &str) -> SecurityError {
    SecurityError::MalformedStore(format!("bad protected key for '{}'", alias))
}

/// Split an `EncryptedPrivateKeyInfo` into algorithm OID, parameters and data
fn encrypted_key_info<'a>(
    alias: &str,
    der: &'a [u8],
) -> Result<(String, Option<BerObject<'a>>, Vec<u8>)> {
    let (_, info) = parse_der(der).map_err(|_| malformed_key(alias))?;
    let fields = info.as_sequence().map_err(|_| malformed_key(alias))?;
    let [algorithm, data] = fields.as_slice() else {
        return Err(malformed_key(alias));
    };

    let algorithm = algorithm.as_sequence().map_err(|_| malformed_key(alias))?;
    let oid = algorithm
        .first()
        .and_then(|oid| oid.as_oid().ok())
        .ok_or_else(|| malformed_key(alias))?
        .to_id_string();
    let params = algorithm.get(1).cloned();
    let data = data.as_slice().map_err(|_| malformed_key(alias))?.to_vec();

    Ok((oid, params, data))
}

fn expect_oid(alias: &str, found: &str, expected: &str) -> Result<()> {
    if found != expected {
        return Err(SecurityError::Unsupported(format!(
            "key protection algorithm {} for '{}'",
            found, alias
        )));
    }
    Ok(())
}

/// Undo the Sun key protector: a SHA-1 keystream seeded with a 20 byte salt,
/// followed by a SHA-1 check over the recovered PKCS#8 bytes
pub fn recover_jks_key(alias: &str, blob: &[u8], password: &str) -> Result<PKey<Private>> {
    let (oid, _, data) = encrypted_key_info(alias, blob)?;
    expect_oid(alias, &oid, OID_JKS_KEY_PROTECTOR)?;

    if data.len() < 2 * DIGEST_LEN {
        return Err(malformed_key(alias));
    }
    let (salt, rest) = data.split_at(DIGEST_LEN);
    let (encrypted, check) = rest.split_at(rest.len() - DIGEST_LEN);
    let password = utf16_be(password);

    let mut plain = Vec::with_capacity(encrypted.len());
    let mut digest = salt.to_vec();
    for chunk in encrypted.chunks(DIGEST_LEN) {
        let mut hasher = Hasher::new(MessageDigest::sha1())?;
        hasher.update(&password)?;
        hasher.update(&digest)?;
        digest = hasher.finish()?.to_vec();
        plain.extend(chunk.iter().zip(&digest).map(|(c, k)| c ^ k));
    }

    let mut hasher = Hasher::new(MessageDigest::sha1())?;
    hasher.update(&password)?;
    hasher.update(&plain)?;
    if *hasher.finish()? != *check {
        return Err(SecurityError::UnrecoverableKey(alias.to_string()));
    }

    Ok(PKey::private_key_from_pkcs8(&plain)?)
}

/// Undo PBEWithMD5AndTripleDES as used by JCEKS
pub fn recover_jceks_key(alias: &str, blob: &[u8], password: &str) -> Result<PKey<Private>> {
    let (oid, params, data) = encrypted_key_info(alias, blob)?;
    expect_oid(alias, &oid, OID_JCEKS_KEY_PROTECTOR)?;

    let params = params.ok_or_else(|| malformed_key(alias))?;
    let params = params.as_sequence().map_err(|_| malformed_key(alias))?;
    let (salt, iterations) = match params.as_slice() {
        [salt, iterations] => (
            salt.as_slice().map_err(|_| malformed_key(alias))?,
            iterations.as_u32().map_err(|_| malformed_key(alias))?,
        ),
        _ => return Err(malformed_key(alias)),
    };
    if salt.len() != 8 || iterations == 0 {
        return Err(malformed_key(alias));
    }
    if iterations > MAX_JCEKS_ITERATIONS {
        return Err(SecurityError::Unsupported(format!(
            "{} key derivation iterations for '{}', at most {}",
            iterations, alias, MAX_JCEKS_ITERATIONS
        )));
    }
    if !password.is_ascii() {
        return Err(SecurityError::Unsupported(format!(
            "non-ASCII password for JCEKS key '{}'",
            alias
        )));
    }

    let (key, iv) = jceks_key_iv(salt, iterations, password.as_bytes())?;
    let plain = decrypt(Cipher::des_ede3_cbc(), &key, Some(&iv), &data)
        .map_err(|_| SecurityError::UnrecoverableKey(alias.to_string()))?;

    PKey::private_key_from_pkcs8(&plain)
        .map_err(|_| SecurityError::UnrecoverableKey(alias.to_string()))
}

/// Derive the 24 byte triple DES key and 8 byte IV from salt and password
fn jceks_key_iv(salt: &[u8], iterations: u32, password: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut salt = salt.to_vec();
    if salt[..4] == salt[4..] {
        for i in 0..2 {
            salt.swap(i, 3 - i);
        }
    }

    let mut derived = Vec::with_capacity(32);
    for half in salt.chunks(4) {
        let mut block = half.to_vec();
        for _ in 0..iterations {
            let mut input = block;
            input.extend_from_slice(password);
            block = hash(MessageDigest::md5(), &input)?.to_vec();
        }
        derived.extend(block);
    }

    let iv = derived.split_off(24);
    Ok((derived, iv))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY_JKS: &[u8] = include_bytes!("../../../tests/fixtures/identity.jks");
    const IDENTITY_JCEKS: &[u8] = include_bytes!("../../../tests/fixtures/identity.jceks");
    const TRUST_JKS: &[u8] = include_bytes!("../../../tests/fixtures/trust.jks");
    const CACERTS_JKS: &[u8] = include_bytes!("../../../tests/fixtures/cacerts.jks");

    fn aliases(entries: &[(String, Entry)]) -> Vec<&str> {
        let mut aliases: Vec<&str> = entries.iter().map(|(a, _)| a.as_str()).collect();
        aliases.sort_unstable();
        aliases
    }

    #[test]
    fn test_read_identity_jks() {
        let entries = read(IDENTITY_JKS, "storepass", StoreFormat::Jks).unwrap();
        assert_eq!(aliases(&entries), vec!["id", "id_alpha", "id_beta"]);

        for (alias, entry) in &entries {
            let Entry::PrivateKey { key, chain } = entry else {
                panic!("'{}' should be a key entry", alias);
            };
            assert_eq!(chain.len(), 1);
            assert!(chain[0].subject().contains(&format!("{}.client.test", alias)));

            let private = key.unlock(alias, "keypass").unwrap();
            assert!(private.public_eq(&chain[0].public_key().unwrap()));
        }
    }

    #[test]
    fn test_jks_wrong_key_password() {
        let entries = read(IDENTITY_JKS, "storepass", StoreFormat::Jks).unwrap();
        let (alias, Entry::PrivateKey { key, .. }) = &entries[0] else {
            panic!("expected a key entry");
        };
        assert!(matches!(
            key.unlock(alias, "storepass"),
            Err(SecurityError::UnrecoverableKey(_))
        ));
    }

    #[test]
    fn test_integrity_check() {
        assert!(matches!(
            read(IDENTITY_JKS, "wrong", StoreFormat::Jks),
            Err(SecurityError::Integrity)
        ));
        // no password, no check
        assert_eq!(read(IDENTITY_JKS, "", StoreFormat::Jks).unwrap().len(), 3);

        let mut tampered = IDENTITY_JKS.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            read(&tampered, "storepass", StoreFormat::Jks),
            Err(SecurityError::Integrity)
        ));
    }

    #[test]
    fn test_truncated_store() {
        let truncated = &IDENTITY_JKS[..IDENTITY_JKS.len() / 2];
        assert!(matches!(
            read(truncated, "storepass", StoreFormat::Jks),
            Err(SecurityError::MalformedStore(_))
        ));
        assert!(read(&IDENTITY_JKS[..6], "", StoreFormat::Jks).is_err());
    }

    #[test]
    fn test_magic_must_match_format() {
        assert!(read(IDENTITY_JKS, "storepass", StoreFormat::Jceks).is_err());
        assert!(read(IDENTITY_JKS, "storepass", StoreFormat::Pkcs12).is_err());
    }

    #[test]
    fn test_read_trust_jks() {
        let entries = read(TRUST_JKS, "trustpass", StoreFormat::Jks).unwrap();
        assert_eq!(aliases(&entries), vec!["example", "test-ca"]);
        assert!(entries.iter().all(|(_, e)| e.is_trusted_certificate()));
    }

    #[test]
    fn test_mixed_store() {
        let entries = read(CACERTS_JKS, "changeit", StoreFormat::Jks).unwrap();
        assert_eq!(aliases(&entries), vec!["stray-key", "test-ca"]);
    }

    #[test]
    fn test_read_identity_jceks() {
        let entries = read(IDENTITY_JCEKS, "storepass", StoreFormat::Jceks).unwrap();
        assert_eq!(aliases(&entries), vec!["id"]);

        let (alias, Entry::PrivateKey { key, chain }) = &entries[0] else {
            panic!("expected a key entry");
        };
        assert!(matches!(key, ProtectedKey::Jceks(_)));

        let private = key.unlock(alias, "keypass").unwrap();
        assert_eq!(private.id(), openssl::pkey::Id::RSA);
        assert!(private.public_eq(&chain[0].public_key().unwrap()));

        assert!(key.unlock(alias, "wrong").is_err());
    }

    #[test]
    fn test_jceks_salt_halves() {
        // equal halves are scrambled before derivation
        let (key_a, iv_a) = jceks_key_iv(&[1, 2, 3, 4, 1, 2, 3, 4], 1, b"pw").unwrap();
        let (key_b, iv_b) = jceks_key_iv(&[4, 3, 2, 1, 1, 2, 3, 4], 1, b"pw").unwrap();
        assert_eq!(key_a, key_b);
        assert_eq!(iv_a, iv_b);
        assert_eq!(key_a.len(), 24);
        assert_eq!(iv_a.len(), 8);
    }

    /// `EncryptedPrivateKeyInfo` protected with PBEWithMD5AndTripleDES
    fn jceks_key_info(iterations: &[u8]) -> Vec<u8> {
        fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
            let mut out = vec![tag, content.len() as u8];
            out.extend_from_slice(content);
            out
        }

        let oid = [0x2B, 0x06, 0x01, 0x04, 0x01, 0x2A, 0x02, 0x13, 0x01];
        let params = [tlv(0x04, &[1, 2, 3, 4, 5, 6, 7, 8]), tlv(0x02, iterations)].concat();
        let algorithm = [tlv(0x06, &oid), tlv(0x30, &params)].concat();
        tlv(0x30, &[tlv(0x30, &algorithm), tlv(0x04, &[0u8; 16])].concat())
    }

    #[test]
    fn test_jceks_iteration_count_is_bounded() {
        let excessive = jceks_key_info(&[0x7F, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            recover_jceks_key("huge", &excessive, "storepass"),
            Err(SecurityError::Unsupported(_))
        ));

        let zero = jceks_key_info(&[0x00]);
        assert!(matches!(
            recover_jceks_key("zero", &zero, "storepass"),
            Err(SecurityError::MalformedStore(_))
        ));

        // a sane count gets as far as decryption, which fails on the junk data
        let sane = jceks_key_info(&[0x07, 0xD0]);
        assert!(matches!(
            recover_jceks_key("sane", &sane, "storepass"),
            Err(SecurityError::UnrecoverableKey(_))
        ));
    }
}
