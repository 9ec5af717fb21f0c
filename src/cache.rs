//! Per-host address cache shared by every fetch.
//!
//! Entries are written by the bootstrap resolver and read by the HTTP and
//! HTTP/3 dialers. An entry is never deleted: re-resolution replaces it in
//! place, and the `updating_until` marker keeps concurrent fetches on the
//! (possibly stale) addresses while a single resolution is in flight.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info};

use crate::{MIN_RESOLVER_IP_TTL, RESOLVER_IP_TTL_MAX_JITTER};

struct CachedAddress {
    ips: Vec<IpAddr>,
    expiration: Option<Instant>,
    updating_until: Option<Instant>,
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CachedLookup {
    /// Cached addresses, empty when the host is unknown.
    pub ips: Vec<IpAddr>,
    /// Whether the entry's expiration has passed.
    pub expired: bool,
    /// Whether a re-resolution is currently in flight.
    pub updating: bool,
}

/// Hostname to resolved-address mapping with expiration.
pub struct AddressCache {
    entries: RwLock<HashMap<String, CachedAddress>>,
    request_timeout: Duration,
}

impl AddressCache {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            request_timeout,
        }
    }

    /// Returns the cached addresses for `host` along with expiration state.
    ///
    /// The `updating` flag is only reported for expired entries; fresh
    /// entries are used as-is regardless of concurrent resolutions.
    pub fn lookup(&self, host: &str) -> CachedLookup {
        let entries = self.entries.read();
        let Some(entry) = entries.get(host) else {
            debug!("[{host}] address not found in the cache");
            return CachedLookup {
                ips: Vec::new(),
                expired: false,
                updating: false,
            };
        };
        let ips = entry.ips.clone();
        let expiration = entry.expiration;
        let updating_until = entry.updating_until;
        drop(entries);

        let now = Instant::now();
        let expired = expiration.is_some_and(|at| at <= now);
        let mut updating = false;
        if expired {
            if updating_until.is_some_and(|until| until > now) {
                updating = true;
                debug!("[{host}] cached addresses are being updated");
            } else {
                debug!("[{host}] cached addresses expired, not being updated yet");
            }
        }
        CachedLookup {
            ips,
            expired,
            updating,
        }
    }

    /// Stores `ips` for `host`, deduplicated, valid for at least
    /// `MIN_RESOLVER_IP_TTL` plus a random jitter.
    ///
    /// Clears any in-flight update marker. Empty address lists are ignored.
    pub fn save(&self, host: &str, ips: Vec<IpAddr>, ttl: Duration) {
        let ips = unique_ips(ips);
        if ips.is_empty() {
            return;
        }
        let mut ttl = ttl.max(MIN_RESOLVER_IP_TTL);
        let jitter = rand::thread_rng().gen_range(0..RESOLVER_IP_TTL_MAX_JITTER.as_secs());
        ttl += Duration::from_secs(jitter);

        if ips.len() == 1 {
            info!("[{host}] cached address [{}], valid for {ttl:?}", ips[0]);
        } else {
            info!(
                "[{host}] cached {} addresses (first: {}), valid for {ttl:?}",
                ips.len(),
                ips[0]
            );
        }
        self.entries.write().insert(
            host.to_string(),
            CachedAddress {
                ips,
                expiration: Some(Instant::now() + ttl),
                updating_until: None,
            },
        );
    }

    /// Single-address convenience writer.
    pub fn save_one(&self, host: &str, ip: IpAddr, ttl: Duration) {
        self.save(host, vec![ip], ttl);
    }

    /// Refreshes an entry with its stale addresses for exactly `grace`,
    /// without the TTL floor or jitter of [`AddressCache::save`].
    ///
    /// Used when re-resolution failed but the previous addresses are still
    /// worth trying.
    pub fn extend_grace(&self, host: &str, ips: Vec<IpAddr>, grace: Duration) {
        let ips = unique_ips(ips);
        if ips.is_empty() {
            return;
        }
        self.entries.write().insert(
            host.to_string(),
            CachedAddress {
                ips,
                expiration: Some(Instant::now() + grace),
                updating_until: None,
            },
        );
    }

    /// Marks an existing entry as being re-resolved for the duration of one
    /// request timeout, so concurrent fetches keep using the stale addresses
    /// instead of piling on resolutions.
    pub fn mark_updating(&self, host: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(host) {
            entry.updating_until = Some(Instant::now() + self.request_timeout);
        }
    }

    #[cfg(test)]
    pub(crate) fn expiration_of(&self, host: &str) -> Option<Instant> {
        self.entries.read().get(host).and_then(|e| e.expiration)
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&self, host: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(host) {
            entry.expiration = Some(Instant::now() - Duration::from_secs(1));
        }
    }
}

fn unique_ips(ips: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut unique: Vec<IpAddr> = Vec::with_capacity(ips.len());
    for ip in ips {
        if !unique.contains(&ip) {
            unique.push(ip);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    /// A saved entry is returned verbatim (deduplicated) and is not expired.
    #[test]
    fn save_then_lookup_roundtrip() {
        let cache = AddressCache::new(Duration::from_secs(30));
        cache.save(
            "example.test",
            vec![v4(203, 0, 113, 7), v4(203, 0, 113, 7), v4(203, 0, 113, 8)],
            Duration::from_secs(300),
        );
        let found = cache.lookup("example.test");
        assert_eq!(found.ips, vec![v4(203, 0, 113, 7), v4(203, 0, 113, 8)]);
        assert!(!found.expired);
        assert!(!found.updating);
    }

    /// Unknown hosts yield an empty, non-expired lookup.
    #[test]
    fn lookup_miss() {
        let cache = AddressCache::new(Duration::from_secs(30));
        let found = cache.lookup("nowhere.test");
        assert!(found.ips.is_empty());
        assert!(!found.expired);
        assert!(!found.updating);
    }

    /// TTLs below the floor are clamped up, with at most the jitter on top.
    #[test]
    fn short_ttl_is_clamped_with_bounded_jitter() {
        let cache = AddressCache::new(Duration::from_secs(30));
        let before = Instant::now();
        cache.save("example.test", vec![v4(203, 0, 113, 7)], Duration::from_secs(1));
        let expiration = cache.expiration_of("example.test").unwrap();
        assert!(expiration >= before + MIN_RESOLVER_IP_TTL);
        assert!(expiration < before + MIN_RESOLVER_IP_TTL + RESOLVER_IP_TTL_MAX_JITTER + Duration::from_secs(1));
    }

    /// The grace writer bypasses the TTL floor entirely.
    #[test]
    fn extend_grace_skips_clamping() {
        let cache = AddressCache::new(Duration::from_secs(30));
        let before = Instant::now();
        cache.extend_grace("example.test", vec![v4(203, 0, 113, 7)], Duration::from_secs(900));
        let expiration = cache.expiration_of("example.test").unwrap();
        assert!(expiration >= before + Duration::from_secs(899));
        assert!(expiration <= before + Duration::from_secs(901));
    }

    /// An expired entry being re-resolved reports `updating`, so callers keep
    /// using its stale addresses instead of resolving again.
    #[test]
    fn updating_is_reported_only_after_expiry() {
        let cache = AddressCache::new(Duration::from_secs(30));
        cache.save("example.test", vec![v4(203, 0, 113, 7)], Duration::from_secs(300));
        cache.mark_updating("example.test");
        let fresh = cache.lookup("example.test");
        assert!(!fresh.expired);
        assert!(!fresh.updating);

        cache.force_expire("example.test");
        let stale = cache.lookup("example.test");
        assert!(stale.expired);
        assert!(stale.updating);
        assert_eq!(stale.ips, vec![v4(203, 0, 113, 7)]);
    }

    /// A fresh save clears the update marker.
    #[test]
    fn save_clears_updating_marker() {
        let cache = AddressCache::new(Duration::from_secs(30));
        cache.save("example.test", vec![v4(203, 0, 113, 7)], Duration::from_secs(300));
        cache.mark_updating("example.test");
        cache.save("example.test", vec![v4(203, 0, 113, 9)], Duration::from_secs(300));
        cache.force_expire("example.test");
        let found = cache.lookup("example.test");
        assert!(found.expired);
        assert!(!found.updating);
        assert_eq!(found.ips, vec![v4(203, 0, 113, 9)]);
    }

    /// Marking an unknown host is a no-op.
    #[test]
    fn mark_updating_unknown_host() {
        let cache = AddressCache::new(Duration::from_secs(30));
        cache.mark_updating("nowhere.test");
        assert!(cache.lookup("nowhere.test").ips.is_empty());
    }
}
