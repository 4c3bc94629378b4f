//! Versioned response cache.
//!
//! The store holds any number of named generations. Install fills a new
//! generation atomically from the manifest; run-time writes grow the current
//! generation one response at a time; activation drops every generation but
//! the current one.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::header::HeaderMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::http::{CacheKey, Request, Response, ResponseClass, ResponseType, Url};
use crate::network::Network;

/// A response as kept in a generation.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    kind: ResponseType,
    digest: String,
    stored_at: DateTime<Utc>,
    /// App shell entries written at install; never evicted for space.
    pinned: bool,
    seq: u64,
}

impl CachedResponse {
    fn from_response(response: &Response, pinned: bool) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            kind: response.kind,
            digest: body_digest(&response.body),
            stored_at: Utc::now(),
            pinned,
            seq: 0,
        }
    }

    /// Returns true if the body still hashes to the digest taken when stored.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        body_digest(&self.body) == self.digest
    }

    /// Returns when the entry was written.
    #[must_use]
    pub const fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    /// Returns the size of the stored body in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Returns a fresh copy of the response for a caller.
    #[must_use]
    pub fn to_response(&self) -> Response {
        Response {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            kind: self.kind,
        }
    }
}

fn body_digest(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

#[derive(Debug, Default)]
struct Generation {
    entries: HashMap<CacheKey, CachedResponse>,
    bytes: u64,
    next_seq: u64,
}

impl Generation {
    fn bytes_after_put(&self, key: &CacheKey, entry: &CachedResponse) -> u64 {
        let replaced = self.entries.get(key).map_or(0, CachedResponse::size);
        self.bytes - replaced + entry.size()
    }

    fn put(&mut self, key: CacheKey, mut entry: CachedResponse) {
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.bytes = self.bytes_after_put(&key, &entry);
        self.entries.insert(key, entry);
    }

    /// Evicts unpinned entries, oldest first, until `entry` fits under
    /// `limit`. Nothing is evicted when it cannot fit at all, and `None` is
    /// returned. Otherwise returns the number of entries evicted.
    fn make_room(&mut self, key: &CacheKey, entry: &CachedResponse, limit: u64) -> Option<usize> {
        let mut needed = self.bytes_after_put(key, entry);
        if needed <= limit {
            return Some(0);
        }

        let mut candidates: Vec<(u64, &CacheKey, u64)> = self
            .entries
            .iter()
            .filter(|(k, e)| !e.pinned && *k != key)
            .map(|(k, e)| (e.seq, k, e.size()))
            .collect();
        candidates.sort_unstable_by_key(|(seq, ..)| *seq);

        let mut victims = Vec::new();
        for (_, k, size) in candidates {
            if needed <= limit {
                break;
            }
            needed -= size;
            victims.push(k.clone());
        }
        if needed > limit {
            return None;
        }
        for k in &victims {
            self.remove(k);
        }
        Some(victims.len())
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(old) = self.entries.remove(key) {
            self.bytes -= old.size();
        }
    }
}

/// Summary of one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationStats {
    /// Generation identifier.
    pub name: String,
    /// Number of cached responses.
    pub entries: usize,
    /// Total body bytes.
    pub bytes: u64,
}

/// Named cache generations, safe to share across concurrent fetch handlers.
#[derive(Debug, Default)]
pub struct CacheStore {
    generations: RwLock<BTreeMap<String, Generation>>,
    max_bytes: Option<u64>,
}

impl CacheStore {
    /// Creates an empty store without a byte quota.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a per-generation byte quota.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Fetches every manifest URL and stores them as one unit under
    /// `generation`.
    ///
    /// Nothing is written unless every entry was fetched with a 2xx status.
    /// Entries are added to the generation if it already exists. Returns the
    /// number of entries written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheWrite`] naming the first entry that was
    /// unreachable or not OK, or [`Error::QuotaExceeded`] if the complete set
    /// does not fit.
    pub async fn populate<N: Network + ?Sized>(
        &self,
        generation: &str,
        manifest: &[Url],
        network: &N,
        concurrency: usize,
    ) -> Result<usize> {
        let fetched: Vec<(CacheKey, CachedResponse)> = stream::iter(manifest.iter().cloned())
            .map(|url| async move {
                let request = Request::get(url.clone());
                let response = network.fetch(&request).await.map_err(|e| Error::CacheWrite {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
                if !response.is_ok() {
                    return Err(Error::CacheWrite {
                        url: url.to_string(),
                        reason: format!("status {}", response.status),
                    });
                }
                Ok((request.cache_key(), CachedResponse::from_response(&response, true)))
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await?;

        let mut generations = self.generations.write().await;
        let mut staged = Generation::default();
        if let Some(existing) = generations.get(generation) {
            staged.entries.clone_from(&existing.entries);
            staged.bytes = existing.bytes;
        }
        let count = fetched.len();
        for (key, entry) in fetched {
            staged.put(key, entry);
        }
        if let Some(limit) = self.max_bytes
            && staged.bytes > limit
        {
            return Err(Error::QuotaExceeded {
                needed: staged.bytes,
                limit,
            });
        }
        generations.insert(generation.to_string(), staged);
        log::info!("Cached {count} app shell entries into {generation}");
        Ok(count)
    }

    /// Looks up `request` in `generation`.
    ///
    /// An entry whose body no longer matches its digest is dropped and
    /// reported as absent.
    pub async fn lookup(&self, generation: &str, request: &Request) -> Option<Response> {
        let key = request.cache_key();
        {
            let generations = self.generations.read().await;
            let entry = generations.get(generation)?.entries.get(&key)?;
            if entry.is_intact() {
                return Some(entry.to_response());
            }
        }

        log::warn!("Dropping corrupted cache entry {} in {generation}", key.url());
        if let Some(generation) = self.generations.write().await.get_mut(generation) {
            generation.remove(&key);
        }
        None
    }

    /// Stores `response` for `request` in `generation`.
    ///
    /// Only same-origin `200` responses to `GET` requests are written. Under a
    /// quota the oldest run-time entries make room; app shell entries stay.
    /// Every failure (wrong class, missing generation, no room) is logged,
    /// never returned. Returns true if the response was written.
    pub async fn store(&self, generation: &str, request: &Request, response: &Response) -> bool {
        if request.method != reqwest::Method::GET {
            return false;
        }
        let class = response.classify();
        if class != ResponseClass::Cacheable {
            log::debug!("Not caching {} ({class:?})", request.url);
            return false;
        }

        let key = request.cache_key();
        let entry = CachedResponse::from_response(response, false);
        let mut generations = self.generations.write().await;
        let Some(target) = generations.get_mut(generation) else {
            log::warn!("Cache generation {generation} is gone, dropping write for {}", request.url);
            return false;
        };
        if let Some(limit) = self.max_bytes {
            match target.make_room(&key, &entry, limit) {
                Some(0) => {}
                Some(evicted) => {
                    log::debug!("Evicted {evicted} entries from {generation} for {}", request.url);
                }
                None => {
                    let needed = target.bytes_after_put(&key, &entry);
                    let err = Error::QuotaExceeded { needed, limit };
                    log::warn!("Skipping cache write for {}: {err}", request.url);
                    return false;
                }
            }
        }
        target.put(key, entry);
        true
    }

    /// Deletes a whole generation. Returns true if it existed.
    pub async fn evict(&self, generation: &str) -> bool {
        self.generations.write().await.remove(generation).is_some()
    }

    /// Deletes every generation except `keep`. Returns the names deleted.
    pub async fn evict_except(&self, keep: &str) -> Vec<String> {
        let mut generations = self.generations.write().await;
        let stale: Vec<String> = generations
            .keys()
            .filter(|name| name.as_str() != keep)
            .cloned()
            .collect();
        for name in &stale {
            log::info!("Deleting old cache: {name}");
            generations.remove(name);
        }
        stale
    }

    /// Returns the names of all generations.
    pub async fn generations(&self) -> Vec<String> {
        self.generations.read().await.keys().cloned().collect()
    }

    /// Returns per-generation statistics.
    pub async fn stats(&self) -> Vec<GenerationStats> {
        self.generations
            .read()
            .await
            .iter()
            .map(|(name, g)| GenerationStats {
                name: name.clone(),
                entries: g.entries.len(),
                bytes: g.bytes,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::MockNetwork;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn shell_network() -> MockNetwork {
        let net = MockNetwork::new();
        net.route("http://app.test/", Response::new(200, "<html>home</html>"));
        net.route("http://app.test/pwa-offline", Response::new(200, "<html>offline</html>"));
        net.route(
            "https://cdn.jsdelivr.net/npm/chart.js",
            Response::new(200, "chart").with_kind(ResponseType::Cors),
        );
        net
    }

    fn manifest() -> Vec<Url> {
        vec![
            url("http://app.test/"),
            url("http://app.test/pwa-offline"),
            url("https://cdn.jsdelivr.net/npm/chart.js"),
        ]
    }

    #[tokio::test]
    async fn populate_stores_every_manifest_entry() {
        let cache = CacheStore::new();
        let net = shell_network();
        let count = cache.populate("v1", &manifest(), &net, 2).await.unwrap();
        assert_eq!(count, 3);

        for entry in manifest() {
            let hit = cache.lookup("v1", &Request::get(entry)).await.unwrap();
            assert_eq!(hit.status, 200);
        }
    }

    #[tokio::test]
    async fn populate_is_all_or_nothing() {
        let cache = CacheStore::new();
        let net = shell_network();
        net.fail("https://cdn.jsdelivr.net/npm/chart.js");

        let err = cache.populate("v1", &manifest(), &net, 2).await.unwrap_err();
        assert!(matches!(err, Error::CacheWrite { ref url, .. } if url.contains("chart.js")));
        assert!(cache.generations().await.is_empty());
    }

    #[tokio::test]
    async fn populate_rejects_non_ok_entries() {
        let cache = CacheStore::new();
        let net = shell_network();
        let mut with_missing = manifest();
        with_missing.push(url("http://app.test/static/missing.css"));

        let err = cache.populate("v1", &with_missing, &net, 1).await.unwrap_err();
        assert!(matches!(err, Error::CacheWrite { ref reason, .. } if reason.contains("404")));
    }

    #[tokio::test]
    async fn failed_populate_leaves_other_generations_alone() {
        let cache = CacheStore::new();
        let net = shell_network();
        cache.populate("v1", &manifest(), &net, 2).await.unwrap();

        net.set_offline(true);
        assert!(cache.populate("v2", &manifest(), &net, 2).await.is_err());
        assert_eq!(cache.generations().await, vec!["v1".to_string()]);
        assert!(cache.lookup("v1", &Request::get(url("http://app.test/"))).await.is_some());
    }

    #[tokio::test]
    async fn store_only_writes_cacheable_responses() {
        let cache = CacheStore::new();
        cache.populate("v1", &[], &MockNetwork::new(), 1).await.unwrap();
        let req = Request::get(url("http://app.test/static/app.js"));

        assert!(!cache.store("v1", &req, &Response::new(302, "")).await);
        assert!(!cache.store("v1", &req, &Response::new(500, "")).await);
        assert!(
            !cache
                .store("v1", &req, &Response::new(200, "x").with_kind(ResponseType::Opaque))
                .await
        );
        assert!(cache.lookup("v1", &req).await.is_none());

        assert!(cache.store("v1", &req, &Response::new(200, "js")).await);
        assert_eq!(cache.lookup("v1", &req).await.unwrap().body, Bytes::from("js"));
    }

    #[tokio::test]
    async fn store_ignores_non_get_requests() {
        let cache = CacheStore::new();
        cache.populate("v1", &[], &MockNetwork::new(), 1).await.unwrap();
        let req = Request::post_json(url("http://app.test/vendor/create_vouchers"), "{}");
        assert!(!cache.store("v1", &req, &Response::new(200, "ok")).await);
    }

    #[tokio::test]
    async fn store_into_missing_generation_is_dropped() {
        let cache = CacheStore::new();
        let req = Request::get(url("http://app.test/a"));
        assert!(!cache.store("gone", &req, &Response::new(200, "a")).await);
        assert!(cache.generations().await.is_empty());
    }

    #[tokio::test]
    async fn store_respects_quota() {
        let cache = CacheStore::new().with_max_bytes(Some(4));
        cache.populate("v1", &[], &MockNetwork::new(), 1).await.unwrap();
        let small = Request::get(url("http://app.test/small"));
        let big = Request::get(url("http://app.test/big"));

        assert!(cache.store("v1", &small, &Response::new(200, "abc")).await);
        assert!(!cache.store("v1", &big, &Response::new(200, "abcdef")).await);
        // Overwriting an entry only counts the difference.
        assert!(cache.store("v1", &small, &Response::new(200, "abcd")).await);
        assert_eq!(cache.stats().await[0].bytes, 4);
    }

    #[tokio::test]
    async fn quota_evicts_oldest_runtime_entries_first() {
        let net = MockNetwork::new();
        net.route("http://app.test/", Response::new(200, "home"));
        let cache = CacheStore::new().with_max_bytes(Some(10));
        cache.populate("v1", &[url("http://app.test/")], &net, 1).await.unwrap();
        let a = Request::get(url("http://app.test/a"));
        let b = Request::get(url("http://app.test/b"));
        let c = Request::get(url("http://app.test/c"));

        assert!(cache.store("v1", &a, &Response::new(200, "aaa")).await);
        assert!(cache.store("v1", &b, &Response::new(200, "bb")).await);
        assert!(cache.store("v1", &c, &Response::new(200, "ccc")).await);

        assert!(cache.lookup("v1", &a).await.is_none());
        assert!(cache.lookup("v1", &b).await.is_some());
        assert!(cache.lookup("v1", &c).await.is_some());
        assert!(cache.lookup("v1", &Request::get(url("http://app.test/"))).await.is_some());
    }

    #[tokio::test]
    async fn paged_browsing_stays_within_quota() {
        let net = MockNetwork::new();
        net.route("http://app.test/", Response::new(200, "home"));
        let cache = CacheStore::new().with_max_bytes(Some(64));
        cache.populate("v1", &[url("http://app.test/")], &net, 1).await.unwrap();

        for page in 0..500 {
            let req = Request::get(url(&format!("http://app.test/vendor/vouchers?page={page}")));
            assert!(cache.store("v1", &req, &Response::new(200, format!("page {page:04}"))).await);
            assert!(cache.stats().await[0].bytes <= 64);
        }

        let shell = Request::get(url("http://app.test/"));
        assert_eq!(cache.lookup("v1", &shell).await.unwrap().body, "home");
        let latest = Request::get(url("http://app.test/vendor/vouchers?page=499"));
        assert!(cache.lookup("v1", &latest).await.is_some());
    }

    #[tokio::test]
    async fn pinned_shell_is_never_evicted_for_space() {
        let net = MockNetwork::new();
        net.route("http://app.test/", Response::new(200, "home"));
        let cache = CacheStore::new().with_max_bytes(Some(6));
        cache.populate("v1", &[url("http://app.test/")], &net, 1).await.unwrap();

        let big = Request::get(url("http://app.test/big"));
        assert!(!cache.store("v1", &big, &Response::new(200, "abc")).await);
        assert!(cache.lookup("v1", &Request::get(url("http://app.test/"))).await.is_some());
        assert_eq!(cache.stats().await[0].entries, 1);
    }

    #[tokio::test]
    async fn populate_over_quota_fails() {
        let cache = CacheStore::new().with_max_bytes(Some(5));
        let err = cache.populate("v1", &manifest(), &shell_network(), 2).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
        assert!(cache.generations().await.is_empty());
    }

    #[tokio::test]
    async fn evict_except_keeps_only_current() {
        let cache = CacheStore::new();
        let net = shell_network();
        cache.populate("v1", &manifest(), &net, 2).await.unwrap();
        cache.populate("v2", &manifest()[..1], &net, 2).await.unwrap();

        let deleted = cache.evict_except("v2").await;
        assert_eq!(deleted, vec!["v1".to_string()]);
        assert_eq!(cache.generations().await, vec!["v2".to_string()]);
        let offline = Request::get(url("http://app.test/pwa-offline"));
        assert!(cache.lookup("v1", &offline).await.is_none());
        assert!(cache.lookup("v2", &offline).await.is_none());
    }

    #[tokio::test]
    async fn evict_removes_generation() {
        let cache = CacheStore::new();
        cache.populate("v1", &[], &MockNetwork::new(), 1).await.unwrap();
        assert!(cache.evict("v1").await);
        assert!(!cache.evict("v1").await);
    }

    #[tokio::test]
    async fn corrupted_entry_is_dropped_on_lookup() {
        let cache = CacheStore::new();
        cache.populate("v1", &manifest(), &shell_network(), 2).await.unwrap();
        let home = Request::get(url("http://app.test/"));
        {
            let mut generations = cache.generations.write().await;
            let entry = generations
                .get_mut("v1")
                .unwrap()
                .entries
                .get_mut(&home.cache_key())
                .unwrap();
            entry.body = Bytes::from_static(b"tampered");
        }
        assert!(cache.lookup("v1", &home).await.is_none());
        assert_eq!(cache.stats().await[0].entries, 2);
    }
}
