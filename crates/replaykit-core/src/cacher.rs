//! Asset caching collaborator driven by the ingestion loop.
//!
//! The loop only tells the cacher *what* to cache. `LocalCacher` turns
//! those requests into deduplicated [`AssetJob`]s on a channel; whoever
//! holds the receiving end does the fetching (or, in the binary, writes a
//! manifest). Problems are reported asynchronously on the error channel
//! and never stop the loop.

use crossbeam::channel::{self, Receiver, Sender};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use url::Url;

use crate::config::CacheConfig;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid asset url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme {scheme:?} in asset url {url:?}")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("asset job receiver is gone; dropping {url}")]
    JobsDisconnected { url: String },
}

/// What the ingestion loop needs from a cache.
pub trait AssetCacher {
    /// Cache a page asset referenced by a session.
    fn cache_url(&mut self, session_id: u64, url: &str);

    /// Cache a script file referenced by an exception stack trace.
    fn cache_js_file(&mut self, source: &str);

    /// Periodic maintenance; expires stale entries.
    fn update_timeouts(&mut self);

    /// Channel on which asynchronous failures are reported.
    fn errors(&self) -> Receiver<CacheError>;
}

/// A request to store one asset under `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetJob {
    pub key: String,
    pub url: String,
    /// Absent for script sources, which are shared between sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub capacity: NonZeroUsize,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            capacity: NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN),
            ttl: config.ttl(),
        }
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Storage key for an asset: page assets live under their session,
/// script sources under `js/`.
pub fn storage_key(session_id: Option<u64>, url: &str) -> String {
    match session_id {
        Some(session_id) => format!("{session_id}/{}", sha256_hex(url)),
        None => format!("js/{}", sha256_hex(url)),
    }
}

fn parse_asset_url(raw: &str) -> Result<Url, CacheError> {
    let url = Url::parse(raw).map_err(|e| CacheError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(CacheError::UnsupportedScheme {
            url: raw.to_string(),
            scheme: scheme.to_string(),
        }),
    }
}

/// In-process cacher that plans jobs instead of fetching.
pub struct LocalCacher {
    /// storage key -> when the job was issued
    entries: LruCache<String, Instant>,
    ttl: Duration,
    jobs: Sender<AssetJob>,
    errors_tx: Sender<CacheError>,
    errors_rx: Receiver<CacheError>,
}

impl std::fmt::Debug for LocalCacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacher")
            .field("entries", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LocalCacher {
    /// Returns the cacher and the receiving end of its job channel.
    pub fn new(settings: CacheSettings) -> (Self, Receiver<AssetJob>) {
        let (jobs, jobs_rx) = channel::unbounded();
        let (errors_tx, errors_rx) = channel::unbounded();
        let cacher = Self {
            entries: LruCache::new(settings.capacity),
            ttl: settings.ttl,
            jobs,
            errors_tx,
            errors_rx,
        };
        (cacher, jobs_rx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn report(&self, error: CacheError) {
        tracing::debug!(error = %error, "Reporting cache error");
        // we hold a receiver ourselves, so this cannot fail
        let _ = self.errors_tx.send(error);
    }

    fn is_fresh(&self, key: &str, now: Instant) -> bool {
        self.entries
            .peek(key)
            .is_some_and(|issued| now.saturating_duration_since(*issued) < self.ttl)
    }

    fn request(&mut self, session_id: Option<u64>, raw: &str) {
        let url = match parse_asset_url(raw) {
            Ok(url) => url,
            Err(error) => return self.report(error),
        };
        let key = storage_key(session_id, url.as_str());
        let now = Instant::now();
        if self.is_fresh(&key, now) {
            tracing::trace!(key = %key, "Asset already requested");
            metrics::counter!("cache.dedup_hits").increment(1);
            return;
        }

        let job = AssetJob {
            key: key.clone(),
            url: url.into(),
            session_id,
        };
        tracing::debug!(key = %job.key, url = %job.url, "Issuing asset job");
        if let Err(err) = self.jobs.send(job) {
            return self.report(CacheError::JobsDisconnected { url: err.0.url });
        }
        self.entries.put(key, now);
        metrics::counter!("cache.jobs").increment(1);
    }

    /// Drop every entry issued at least `ttl` before `now`.
    ///
    /// Entries are only ever touched by `put`, so LRU order is issue order
    /// and expiry can stop at the first fresh entry.
    pub fn expire_before(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((_, issued)) = self.entries.peek_lru() {
            if now.saturating_duration_since(*issued) < self.ttl {
                break;
            }
            self.entries.pop_lru();
            expired += 1;
        }
        expired
    }
}

impl AssetCacher for LocalCacher {
    fn cache_url(&mut self, session_id: u64, url: &str) {
        self.request(Some(session_id), url);
    }

    fn cache_js_file(&mut self, source: &str) {
        self.request(None, source);
    }

    fn update_timeouts(&mut self) {
        let expired = self.expire_before(Instant::now());
        tracing::info!(expired, remaining = self.entries.len(), "Cache maintenance done");
    }

    fn errors(&self) -> Receiver<CacheError> {
        self.errors_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(capacity: usize, ttl: Duration) -> CacheSettings {
        CacheSettings {
            capacity: NonZeroUsize::new(capacity).unwrap(),
            ttl,
        }
    }

    #[test]
    fn storage_keys_are_namespaced() {
        let page = storage_key(Some(7), "https://a/app.css");
        let js = storage_key(None, "https://a/app.css");
        assert!(page.starts_with("7/"));
        assert!(js.starts_with("js/"));
        assert_eq!(page.len(), "7/".len() + 64);
        assert_eq!(page[2..], js[3..]);
    }

    #[test]
    fn repeated_requests_issue_one_job() {
        let (mut cacher, jobs) = LocalCacher::new(settings(16, Duration::from_secs(60)));
        cacher.cache_url(1, "https://cdn.example.com/a.css");
        cacher.cache_url(1, "https://cdn.example.com/a.css");
        cacher.cache_url(2, "https://cdn.example.com/a.css");

        let issued: Vec<AssetJob> = jobs.try_iter().collect();
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0].session_id, Some(1));
        assert_eq!(issued[1].session_id, Some(2));
        assert_eq!(cacher.len(), 2);
    }

    #[test]
    fn js_sources_are_shared_across_sessions() {
        let (mut cacher, jobs) = LocalCacher::new(settings(16, Duration::from_secs(60)));
        cacher.cache_js_file("https://cdn.example.com/app.js");
        cacher.cache_js_file("https://cdn.example.com/app.js");
        let issued: Vec<AssetJob> = jobs.try_iter().collect();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].session_id, None);
        assert!(issued[0].key.starts_with("js/"));
    }

    #[test]
    fn bad_urls_go_to_the_error_channel() {
        let (mut cacher, jobs) = LocalCacher::new(CacheSettings::default());
        let errors = cacher.errors();
        cacher.cache_url(1, "not a url");
        cacher.cache_js_file("file:///etc/passwd");

        assert!(jobs.try_recv().is_err());
        assert!(matches!(errors.try_recv(), Ok(CacheError::InvalidUrl { .. })));
        assert_eq!(
            errors.try_recv(),
            Ok(CacheError::UnsupportedScheme {
                url: "file:///etc/passwd".into(),
                scheme: "file".into(),
            })
        );
        assert!(cacher.is_empty());
    }

    #[test]
    fn dropped_job_receiver_is_reported() {
        let (mut cacher, jobs) = LocalCacher::new(CacheSettings::default());
        drop(jobs);
        cacher.cache_url(3, "https://a/b.png");
        assert!(matches!(
            cacher.errors().try_recv(),
            Ok(CacheError::JobsDisconnected { .. })
        ));
        assert!(cacher.is_empty());
    }

    #[test]
    fn expired_entries_are_requested_again() {
        let (mut cacher, jobs) = LocalCacher::new(settings(16, Duration::ZERO));
        cacher.cache_url(1, "https://a/x.css");
        assert_eq!(cacher.expire_before(Instant::now()), 1);
        cacher.cache_url(1, "https://a/x.css");
        assert_eq!(jobs.try_iter().count(), 2);
    }

    #[test]
    fn fresh_entries_survive_maintenance() {
        let (mut cacher, _jobs) = LocalCacher::new(settings(16, Duration::from_secs(3600)));
        cacher.cache_url(1, "https://a/x.css");
        cacher.update_timeouts();
        assert_eq!(cacher.len(), 1);
    }

    #[test]
    fn capacity_bounds_memory() {
        let (mut cacher, _jobs) = LocalCacher::new(settings(2, Duration::from_secs(60)));
        for i in 0..5 {
            cacher.cache_url(1, &format!("https://a/{i}.css"));
        }
        assert_eq!(cacher.len(), 2);
    }

    #[test]
    fn job_serializes_without_missing_session() {
        let job = AssetJob {
            key: "js/abc".into(),
            url: "https://a/app.js".into(),
            session_id: None,
        };
        assert_eq!(
            serde_json::to_string(&job).unwrap(),
            r#"{"key":"js/abc","url":"https://a/app.js"}"#
        );
    }
}
