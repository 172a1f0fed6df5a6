//! Client certificate alias resolution
//!
//! For every outgoing handshake the resolver picks the identity store alias
//! whose key and certificate are presented. With base alias `authz_rpc` and
//! separator `_`:
//!
//! 1. `authz_rpc_<suffix>` when `<suffix>` occurs in the destination host,
//!    the smallest matching suffix winning
//! 2. `authz_rpc` itself
//! 3. no client certificate
//!
//! Suffixes match the host ignoring ASCII case: `authz_rpc_Alpha` is chosen
//! for `api.alpha.example.com` and `authz_rpc_alpha` for `API.ALPHA.EXAMPLE.COM`.
//! An empty suffix never matches.
//!
//! Decisions are cached per destination for the lifetime of the resolver.
//! Nothing expires on its own; call [`ClientAliasResolver::invalidate`] or
//! [`ClientAliasResolver::invalidate_all`] after reloading the identity store.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

pub const DEFAULT_BASE_ALIAS: &str = "authz_rpc";
pub const DEFAULT_SEPARATOR: &str = "_";

/// Peer of a connection, as seen when the handshake starts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Destination {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub struct ClientAliasResolver {
    base: String,
    separator: String,
    cache: DashMap<String, String>,
    scans: AtomicUsize,
}

impl Default for ClientAliasResolver {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_ALIAS)
    }
}

impl ClientAliasResolver {
    pub fn new(base: &str) -> Self {
        Self::with_separator(base, DEFAULT_SEPARATOR)
    }

    pub fn with_separator(base: &str, separator: &str) -> Self {
        ClientAliasResolver {
            base: base.to_string(),
            separator: separator.to_string(),
            cache: DashMap::new(),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Alias to present to `destination`, chosen among `aliases`
    ///
    /// Only successful resolutions are cached. Two threads racing on the same
    /// destination compute the same answer and one insert wins.
    pub fn resolve<I, S>(&self, destination: &Destination, aliases: I) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let key = destination.to_string();
        if let Some(alias) = self.cache.get(&key) {
            return Some(alias.value().clone());
        }

        self.scans.fetch_add(1, Ordering::Relaxed);
        let Some(alias) = self.scan(destination.host(), aliases) else {
            warn!(
                "no client certificate alias '{}' for {}, connecting without one",
                self.base, destination
            );
            return None;
        };

        debug!("client certificate alias '{}' for {}", alias, destination);
        self.cache.insert(key, alias.clone());
        Some(alias)
    }

    fn scan<I, S>(&self, host: &str, aliases: I) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefix = format!("{}{}", self.base, self.separator);
        let host = host.to_ascii_lowercase();

        let mut base_present = false;
        let mut best: Option<String> = None;

        for alias in aliases {
            let alias = alias.as_ref();
            if alias == self.base {
                base_present = true;
                continue;
            }
            let Some(suffix) = alias.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if suffix.is_empty() || !host.contains(&suffix.to_ascii_lowercase()) {
                continue;
            }
            if best.as_deref().map_or(true, |current| alias < current) {
                best = Some(alias.to_string());
            }
        }

        best.or_else(|| base_present.then(|| self.base.clone()))
    }

    /// Cached decision for `destination`
    pub fn cached(&self, destination: &Destination) -> Option<String> {
        self.cache
            .get(&destination.to_string())
            .map(|alias| alias.value().clone())
    }

    /// Forget the decision for `destination`
    pub fn invalidate(&self, destination: &Destination) -> Option<String> {
        self.cache
            .remove(&destination.to_string())
            .map(|(_, alias)| alias)
    }

    /// Forget all decisions
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Number of times the alias set was scanned; cache hits don't count
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const ALIASES: [&str; 3] = ["id", "id_alpha", "id_beta"];

    #[test]
    fn test_suffix_match_wins() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("api.alpha.example.com", 443);
        assert_eq!(resolver.resolve(&dest, ALIASES), Some("id_alpha".to_string()));
    }

    #[test]
    fn test_falls_back_to_base() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("gamma.example.com", 443);
        assert_eq!(resolver.resolve(&dest, ALIASES), Some("id".to_string()));
    }

    #[test]
    fn test_no_alias() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("gamma.example.com", 443);
        assert_eq!(resolver.resolve(&dest, ["id_alpha", "other"]), None);
        assert_eq!(resolver.resolve(&dest, Vec::<String>::new()), None);
        // misses are not cached
        assert_eq!(resolver.cache_len(), 0);
        assert_eq!(resolver.scan_count(), 2);
    }

    #[test]
    fn test_smallest_suffix_breaks_ties() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("alpha-beta.example.com", 8443);
        assert_eq!(resolver.resolve(&dest, ["id_beta", "id_alpha", "id"]), Some("id_alpha".to_string()));

        let resolver = ClientAliasResolver::new("id");
        assert_eq!(resolver.resolve(&dest, ["id_alpha", "id_beta"]), Some("id_alpha".to_string()));
    }

    #[test]
    fn test_host_match_ignores_case() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("API.ALPHA.example.com", 443);
        assert_eq!(resolver.resolve(&dest, ALIASES), Some("id_alpha".to_string()));
    }

    #[test]
    fn test_suffix_match_ignores_case() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("api.alpha.example.com", 443);
        assert_eq!(resolver.resolve(&dest, ["id", "id_Alpha"]), Some("id_Alpha".to_string()));
    }

    #[test]
    fn test_empty_suffix_is_not_a_match() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("anything", 443);
        assert_eq!(resolver.resolve(&dest, ["id_"]), None);
    }

    #[test]
    fn test_custom_separator() {
        let resolver = ClientAliasResolver::with_separator("authz_rpc", "-");
        let dest = Destination::new("alpha.example.com", 443);
        assert_eq!(
            resolver.resolve(&dest, ["authz_rpc", "authz_rpc-alpha", "authz_rpc_alpha"]),
            Some("authz_rpc-alpha".to_string())
        );
    }

    #[test]
    fn test_cache_hit_skips_scan() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("alpha.example.com", 443);

        let first = resolver.resolve(&dest, ALIASES);
        let second = resolver.resolve(&dest, ALIASES);
        assert_eq!(first, second);
        assert_eq!(resolver.scan_count(), 1);

        // the cache answers even when the alias set changed
        assert_eq!(resolver.resolve(&dest, ["id"]), first);
        assert_eq!(resolver.scan_count(), 1);

        // port is part of the key
        resolver.resolve(&Destination::new("alpha.example.com", 8443), ALIASES);
        assert_eq!(resolver.scan_count(), 2);
    }

    #[test]
    fn test_invalidate() {
        let resolver = ClientAliasResolver::new("id");
        let dest = Destination::new("alpha.example.com", 443);

        resolver.resolve(&dest, ALIASES);
        assert_eq!(resolver.cached(&dest), Some("id_alpha".to_string()));
        assert_eq!(resolver.invalidate(&dest), Some("id_alpha".to_string()));
        assert_eq!(resolver.cached(&dest), None);

        assert_eq!(resolver.resolve(&dest, ["id"]), Some("id".to_string()));
        assert_eq!(resolver.scan_count(), 2);

        resolver.invalidate_all();
        assert_eq!(resolver.cache_len(), 0);
    }

    #[test]
    fn test_concurrent_resolution() {
        let resolver = Arc::new(ClientAliasResolver::new("id"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let resolver = Arc::clone(&resolver);
                thread::spawn(move || {
                    let host = if i % 2 == 0 { "alpha.test" } else { "beta.test" };
                    (0..100)
                        .map(|_| resolver.resolve(&Destination::new(host, 443), ALIASES))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let expected = if i % 2 == 0 { "id_alpha" } else { "id_beta" };
            let results = handle.join().unwrap();
            assert!(results.iter().all(|r| r.as_deref() == Some(expected)));
        }
        assert_eq!(resolver.cache_len(), 2);
    }
}
