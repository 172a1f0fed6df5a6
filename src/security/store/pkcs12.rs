//! PKCS#12 reader
//!
//! `p12-keystore` walks the SafeContents and pairs every shrouded key bag
//! with its certificate bags by `localKeyId`, so a store holding several keys
//! yields one key entry per key. Aliases come from the `friendlyName` bag
//! attribute, falling back to `1`, `2`, ... when a bag has none. Certificates
//! that belong to a key chain do not become entries of their own.

use openssl::pkey::PKey;
use p12_keystore::{KeyStore, KeyStoreEntry};
use tracing::{debug, trace};

use super::{Entry, ProtectedKey};
use crate::security::cert::Certificate;
use crate::security::{Result, SecurityError};

/// Read the entries of a PKCS#12 container
///
/// Private keys are resealed under `password`, which doubles as the key
/// password in this format.
pub fn read(bytes: &[u8], password: &str) -> Result<Vec<(String, Entry)>> {
    let keystore = KeyStore::from_pkcs12(bytes, password)
        .map_err(|e| SecurityError::Pkcs12(e.to_string()))?;

    let mut entries = Vec::with_capacity(keystore.entries_count());
    let mut fallback = 0usize;

    for (name, bag) in keystore.entries() {
        let alias = if name.is_empty() {
            fallback += 1;
            fallback.to_string()
        } else {
            name.to_string()
        };

        match bag {
            KeyStoreEntry::PrivateKeyChain(keychain) => {
                let key = PKey::private_key_from_pkcs8(keychain.key())?;
                let chain = keychain
                    .chain()
                    .iter()
                    .map(|cert| Certificate::from_der(cert.as_der()))
                    .collect::<Result<Vec<_>>>()?;
                if chain.is_empty() {
                    return Err(SecurityError::MalformedStore(format!(
                        "key entry '{}' has no certificate",
                        alias
                    )));
                }

                trace!("key entry '{}' with {} certificates", alias, chain.len());
                entries.push((
                    alias,
                    Entry::PrivateKey {
                        key: ProtectedKey::seal(&key, password)?,
                        chain,
                    },
                ));
            }
            KeyStoreEntry::Certificate(cert) => {
                trace!("certificate entry '{}'", alias);
                entries.push((
                    alias,
                    Entry::TrustedCertificate {
                        certificate: Certificate::from_der(cert.as_der())?,
                    },
                ));
            }
            #[allow(unreachable_patterns)]
            _ => debug!("skipping PKCS#12 entry '{}', neither key nor certificate", alias),
        }
    }

    Ok(entries)
}
