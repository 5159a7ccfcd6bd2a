use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::RwLock;

use crate::dns_resolver::{Answer, Resolve};

pub const DEFAULT_CACHE_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    addr: IpAddr,
    expires_at: Instant,
}

/// Hostname -> address cache with expiry and insertion-order eviction.
///
/// Reads use `peek`, which never reorders, so the entry evicted at
/// capacity is always the one written longest ago.
pub struct DnsCache {
    entries: RwLock<LruCache<String, CacheEntry>>,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Expired entries are evicted on the read that finds them.
    pub fn get(&self, host: &str) -> Option<IpAddr> {
        self.fresh_entry(host).map(|entry| entry.addr)
    }

    fn fresh_entry(&self, host: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.peek(host) {
                Some(entry) if now < entry.expires_at => return Some(*entry),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write();
        // another reader may have raced us here; re-check under the write lock
        if entries.peek(host).is_some_and(|e| now >= e.expires_at) {
            entries.pop(host);
        }
        None
    }

    pub fn insert(&self, host: &str, addr: IpAddr, expires_at: Instant) {
        self.entries
            .write()
            .put(host.to_string(), CacheEntry { addr, expires_at });
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Serves hits from the cache and stores every unexpired answer of `inner`.
pub struct CachedResolver<R> {
    inner: R,
    cache: DnsCache,
}

impl<R: Resolve> CachedResolver<R> {
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            cache: DnsCache::new(capacity),
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }
}

#[async_trait]
impl<R: Resolve> Resolve for CachedResolver<R> {
    async fn lookup(&self, host: &str, port: u16) -> Answer {
        if let Some(entry) = self.cache.fresh_entry(host) {
            return Answer {
                addr: Some(entry.addr),
                expires_at: entry.expires_at,
                reachable: false,
            };
        }

        let answer = self.inner.lookup(host, port).await;
        if let Some(addr) = answer.addr {
            if answer.expires_at > Instant::now() {
                self.cache.insert(host, addr, answer.expires_at);
            }
        }
        answer
    }
}
