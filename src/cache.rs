//! Cache for extraction results.
//!
//! This module keys extraction requests, stores successful results through a
//! pluggable `CacheStore` and serves them back for subsequent identical
//! requests instead of calling the API again. This is mostly useful while
//! developing a spider, when the same pages get extracted over and over.
//!
//! A cache key is the SHA-256 of the request fingerprint: the query sent to
//! the API, rendered as JSON with sorted keys. Requests built for the same
//! (url, page type, extra parameters) share a key whichever call path built
//! them. Entries are `bincode` envelopes around the JSON-serialized result,
//! gzip-compressed when compression is enabled.
//!
//! Stores:
//! - `NoCache`: never hits.
//! - `FileStore`: one file per key in a local directory.
//! - `CollectionStore`: a remote key/value collection scoped to a job
//!   (feature `collection-cache`).

use std::fmt::Debug;
use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::config::CacheSettings;
use crate::error::{AutoExtractError, Result};
use crate::query::{ExtractionRequest, ExtractionResult};

const GZIP_LEVEL: u32 = 3;

/// Deterministic text identifying an extraction request.
pub fn fingerprint(request: &ExtractionRequest) -> String {
    canonical_json(&request.to_query()).to_string()
}

/// Hex SHA-256 of the request fingerprint.
pub fn cache_key(request: &ExtractionRequest) -> String {
    let digest = Sha256::digest(fingerprint(request).as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

// serde_json keeps maps sorted unless `preserve_order` gets enabled somewhere in
// the dependency graph, so sort explicitly.
fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key.clone(), canonical_json(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// A persisted cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    compressed: bool,
    value: Vec<u8>,
}

/// Key/value backend for cached results.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Human readable description used in logs.
    fn describe(&self) -> String;

    /// False for stores that never hold anything.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// A store that holds nothing.
#[derive(Debug, Default)]
pub struct NoCache;

#[async_trait]
impl CacheStore for NoCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "no cache".to_string()
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Builder for `FileStore`.
#[derive(Default)]
pub struct FileStoreBuilder {
    cache_dir: Option<PathBuf>,
    compressed: bool,
}

impl FileStoreBuilder {
    /// Sets the directory where cache files will be stored.
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Compressed and uncompressed entries are kept in separate tables.
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Builds the `FileStore`.
    /// This can fail if the cache directory cannot be created or determined.
    pub fn build(self) -> Result<FileStore> {
        let base = match self.cache_dir {
            Some(path) => path,
            None => dirs::cache_dir()
                .ok_or_else(|| {
                    AutoExtractError::ConfigurationError(
                        "Could not determine cache directory".to_string(),
                    )
                })?
                .join("spider-autoextract"),
        };
        let table = if self.compressed { "responses_gzip" } else { "responses" };
        let dir = base.join(table);

        std::fs::create_dir_all(&dir)?;

        let store = FileStore { dir };
        info!("Initializing FileStore with config: {:?}", store);
        Ok(store)
    }
}

/// Stores each entry in its own file.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a new `FileStoreBuilder` to start building a `FileStore`.
    pub fn builder() -> FileStoreBuilder {
        FileStoreBuilder::default()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AutoExtractError::StoreError(format!(
                "Failed to read cache file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.entry_path(key);
        let partial = self.dir.join(format!("{key}.{:08x}.partial", rand::random::<u32>()));
        trace!("Writing {} bytes to cache file: {}", value.len(), path.display());
        fs::write(&partial, value).await.map_err(|e| {
            AutoExtractError::StoreError(format!(
                "Failed to write cache file {}: {}",
                partial.display(),
                e
            ))
        })?;
        fs::rename(&partial, &path).await.map_err(|e| {
            AutoExtractError::StoreError(format!(
                "Failed to move cache file into place {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn describe(&self) -> String {
        format!("FileStore <{}>", self.dir.display())
    }
}

#[cfg(feature = "collection-cache")]
pub use collection::CollectionStore;

#[cfg(feature = "collection-cache")]
mod collection {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use reqwest::{Client, StatusCode};
    use serde_json::json;

    /// A remote key/value collection, usually scoped to the running job.
    #[derive(Debug)]
    pub struct CollectionStore {
        client: Client,
        url: String,
        api_key: String,
    }

    impl CollectionStore {
        /// Store backed by collection `name` of `project`, below the storage
        /// `endpoint`. Calls authenticate with `api_key`.
        pub fn new(endpoint: &str, project: &str, name: &str, api_key: impl Into<String>) -> Self {
            let store = Self {
                client: Client::new(),
                url: format!(
                    "{}/collections/{}/s/{}",
                    endpoint.trim_end_matches('/'),
                    project,
                    name
                ),
                api_key: api_key.into(),
            };
            info!("Initializing CollectionStore for {}", store.url);
            store
        }
    }

    #[async_trait]
    impl CacheStore for CollectionStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let response = self
                .client
                .get(format!("{}/{}", self.url, key))
                .basic_auth(&self.api_key, Some(""))
                .send()
                .await
                .map_err(|e| AutoExtractError::StoreError(e.to_string()))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(AutoExtractError::StoreError(format!(
                    "Collection lookup failed with status {}",
                    response.status()
                )));
            }

            let body: Value = response
                .json()
                .await
                .map_err(|e| AutoExtractError::StoreError(e.to_string()))?;
            let encoded = body.get("value").and_then(Value::as_str).ok_or_else(|| {
                AutoExtractError::StoreError(format!("Collection entry {key} has no value"))
            })?;
            STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| AutoExtractError::StoreError(e.to_string()))
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            let response = self
                .client
                .post(&self.url)
                .basic_auth(&self.api_key, Some(""))
                .json(&json!({"_key": key, "value": STANDARD.encode(value)}))
                .send()
                .await
                .map_err(|e| AutoExtractError::StoreError(e.to_string()))?;

            if !response.status().is_success() {
                return Err(AutoExtractError::StoreError(format!(
                    "Collection write failed with status {}",
                    response.status()
                )));
            }
            Ok(())
        }

        fn describe(&self) -> String {
            format!("CollectionStore <{}>", self.url)
        }
    }
}

// A caller's share of the per-key lock. The map entry goes away with the last
// share, whether the fetch completed, failed or was dropped mid-call.
struct InFlight<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn enter(map: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let lock = Arc::clone(map.entry(key.to_string()).or_default().value());
        Self { map, key, lock }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove_if(self.key, |_, entry| {
            Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) <= 2
        });
    }
}

/// Outcome of `ExtractionCache::fetch`.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub result: ExtractionResult,
    /// True when the result came from the store.
    pub cached: bool,
}

/// Cache in front of the extraction call, shared by both call paths.
#[derive(Debug)]
pub struct ExtractionCache {
    store: Arc<dyn CacheStore>,
    compressed: bool,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ExtractionCache {
    pub fn new(store: Arc<dyn CacheStore>, compressed: bool) -> Self {
        info!(
            "Initializing ExtractionCache: {} | compressed: {}",
            store.describe(),
            compressed
        );
        Self {
            store,
            compressed,
            in_flight: DashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoCache), false)
    }

    /// Opens the store described by the configuration.
    pub fn from_settings(settings: &CacheSettings, api_key: &str) -> Result<Self> {
        match settings {
            CacheSettings::None => Ok(Self::disabled()),
            CacheSettings::File { path, compressed } => {
                let store = FileStore::builder()
                    .cache_dir(path.clone())
                    .compressed(*compressed)
                    .build()?;
                Ok(Self::new(Arc::new(store), *compressed))
            }
            #[cfg(feature = "collection-cache")]
            CacheSettings::Collection {
                endpoint,
                project,
                name,
            } => Ok(Self::new(
                Arc::new(CollectionStore::new(endpoint, project, name, api_key)),
                true,
            )),
            #[cfg(not(feature = "collection-cache"))]
            CacheSettings::Collection { .. } => {
                let _ = api_key;
                Err(AutoExtractError::ConfigurationError(
                    "Collection cache requires the `collection-cache` feature".to_string(),
                ))
            }
        }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Looks `request` up without calling anything.
    pub async fn get(&self, request: &ExtractionRequest) -> Result<Option<ExtractionResult>> {
        self.lookup(&cache_key(request)).await
    }

    /// Returns the cached result for `request`, or runs `call` and stores what
    /// it returns. Errors from `call` are never cached.
    pub async fn fetch<F, Fut>(&self, request: &ExtractionRequest, call: F) -> Result<Fetched>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExtractionResult>>,
    {
        let key = cache_key(request);
        trace!(
            "Checking cache for {} (fingerprint: {})",
            request.url(),
            fingerprint(request)
        );

        if !self.store.is_enabled() {
            let result = call().await?;
            return Ok(Fetched { result, cached: false });
        }

        if let Some(result) = self.lookup(&key).await? {
            debug!("Cache hit for {} ({})", request.url(), request.page_type());
            return Ok(Fetched { result, cached: true });
        }

        // Concurrent misses for one key wait for the first caller and then
        // read what it stored.
        let in_flight = InFlight::enter(&self.in_flight, &key);
        let _held = in_flight.lock.lock().await;
        if let Some(result) = self.lookup(&key).await? {
            debug!("Cache hit after waiting for {}", request.url());
            return Ok(Fetched { result, cached: true });
        }

        debug!("Cache miss for {} ({})", request.url(), request.page_type());
        let result = call().await?;
        let bytes = self.encode(&key, &result)?;
        self.store.put(&key, bytes).await?;
        Ok(Fetched { result, cached: false })
    }

    async fn lookup(&self, key: &str) -> Result<Option<ExtractionResult>> {
        match self.store.get(key).await? {
            Some(bytes) => self.decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn encode(&self, key: &str, result: &ExtractionResult) -> Result<Vec<u8>> {
        let mut value = serde_json::to_vec(result)
            .map_err(|e| AutoExtractError::StoreError(e.to_string()))?;
        if self.compressed {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
            encoder.write_all(&value)?;
            value = encoder.finish()?;
        }
        let entry = CacheEntry {
            key: key.to_string(),
            compressed: self.compressed,
            value,
        };
        Ok(bincode::serialize(&entry)?)
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<ExtractionResult> {
        let entry: CacheEntry = bincode::deserialize(bytes)?;
        if entry.key != key {
            return Err(AutoExtractError::StoreError(format!(
                "Cache entry under {key} belongs to {}",
                entry.key
            )));
        }
        let value = if entry.compressed {
            let mut decoded = Vec::new();
            GzDecoder::new(entry.value.as_slice()).read_to_end(&mut decoded)?;
            decoded
        } else {
            entry.value
        };
        serde_json::from_slice(&value).map_err(|e| AutoExtractError::StoreError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_type::PageType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// In-memory store counting writes.
    #[derive(Debug, Default)]
    struct MemoryStore {
        entries: DashMap<String, Vec<u8>>,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for MemoryStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.entries.get(key).map(|value| value.value().clone()))
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.entries.insert(key.to_string(), value);
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    /// Store whose every operation fails.
    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(AutoExtractError::StoreError("disk on fire".into()))
        }

        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Err(AutoExtractError::StoreError("disk on fire".into()))
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    fn article(url: &str) -> ExtractionRequest {
        ExtractionRequest::new(Url::parse(url).unwrap(), PageType::Article)
    }

    fn result_for(request: &ExtractionRequest) -> ExtractionResult {
        ExtractionResult::from_api_result(
            request,
            json!({"article": {"headline": "Hello élan"}, "html": "<p>hi</p>"}),
        )
    }

    #[test]
    fn identical_requests_share_a_key() {
        let a = article("https://example.com/a").with_extra([
            ("b".to_string(), json!(1)),
            ("a".to_string(), json!({"z": 1, "y": 2})),
        ]);
        let b = article("https://example.com/a").with_extra([
            ("a".to_string(), json!({"y": 2, "z": 1})),
            ("b".to_string(), json!(1)),
        ]);
        assert_eq!(cache_key(&a), cache_key(&b));
        assert_eq!(
            fingerprint(&a),
            r#"{"a":{"y":2,"z":1},"b":1,"pageType":"article","url":"https://example.com/a"}"#
        );

        let other_type =
            ExtractionRequest::new(Url::parse("https://example.com/a").unwrap(), PageType::Product);
        assert_ne!(cache_key(&a), cache_key(&other_type));
        assert_ne!(cache_key(&a), cache_key(&article("https://example.com/b")));
        assert_eq!(cache_key(&a).len(), 64);
    }

    #[test]
    fn entries_round_trip_in_both_modes() {
        let request = article("https://example.com/a");
        let result = result_for(&request);
        for compressed in [true, false] {
            let cache = ExtractionCache::new(Arc::new(NoCache), compressed);
            let bytes = cache.encode("k", &result).unwrap();
            assert_eq!(cache.decode("k", &bytes).unwrap(), result);
        }
    }

    #[test]
    fn entry_under_the_wrong_key_is_rejected() {
        let request = article("https://example.com/a");
        let cache = ExtractionCache::new(Arc::new(NoCache), true);
        let bytes = cache.encode("k1", &result_for(&request)).unwrap();
        assert!(matches!(
            cache.decode("k2", &bytes),
            Err(AutoExtractError::StoreError(_))
        ));
    }

    #[tokio::test]
    async fn miss_calls_and_stores_then_hit_skips_the_call() {
        let store = Arc::new(MemoryStore::default());
        let cache = ExtractionCache::new(store.clone(), true);
        let request = article("https://example.com/a");
        let calls = AtomicUsize::new(0);

        let first = cache
            .fetch(&request, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result_for(&request))
            })
            .await
            .unwrap();
        assert!(!first.cached);

        let second = cache
            .fetch(&request, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result_for(&request))
            })
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.result, first.result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert!(store.entries.contains_key(&cache_key(&request)));
    }

    #[tokio::test]
    async fn failed_calls_are_not_cached() {
        let store = Arc::new(MemoryStore::default());
        let cache = ExtractionCache::new(store.clone(), false);
        let request = article("https://example.com/a");

        let err = cache
            .fetch(&request, || async { Err(AutoExtractError::Cancelled) })
            .await
            .unwrap_err();
        assert!(matches!(err, AutoExtractError::Cancelled));
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test]
    async fn store_failures_are_fatal() {
        let cache = ExtractionCache::new(Arc::new(BrokenStore), false);
        let request = article("https://example.com/a");
        let calls = AtomicUsize::new(0);

        let err = cache
            .fetch(&request, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result_for(&request))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AutoExtractError::StoreError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_misses_are_coalesced() {
        let store = Arc::new(MemoryStore::default());
        let cache = ExtractionCache::new(store.clone(), true);
        let request = article("https://example.com/a");
        let calls = AtomicUsize::new(0);

        let fetch = || {
            cache.fetch(&request, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(result_for(&request))
            })
        };
        let (a, b) = tokio::join!(fetch(), fetch());

        assert_eq!(a.unwrap().result, b.unwrap().result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_fetches_leave_no_lock_behind() {
        let cache = ExtractionCache::new(Arc::new(MemoryStore::default()), false);
        let request = article("https://example.com/slow");

        let fetches = (0..5).map(|_| {
            tokio::time::timeout(
                std::time::Duration::from_millis(10),
                cache.fetch(&request, || async {
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                    Ok(result_for(&request))
                }),
            )
        });
        let outcomes = futures::future::join_all(fetches).await;

        assert!(outcomes.iter().all(|outcome| outcome.is_err()));
        assert_eq!(cache.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let request = article("https://example.com/a");

        let store = FileStore::builder()
            .cache_dir(dir.path())
            .compressed(true)
            .build()
            .unwrap();
        assert!(store.dir().ends_with("responses_gzip"));
        let cache = ExtractionCache::new(Arc::new(store), true);
        cache
            .fetch(&request, || async { Ok(result_for(&request)) })
            .await
            .unwrap();

        let reopened = FileStore::builder()
            .cache_dir(dir.path())
            .compressed(true)
            .build()
            .unwrap();
        let cache = ExtractionCache::new(Arc::new(reopened), true);
        assert_eq!(cache.get(&request).await.unwrap(), Some(result_for(&request)));

        let uncompressed = FileStore::builder()
            .cache_dir(dir.path())
            .compressed(false)
            .build()
            .unwrap();
        let cache = ExtractionCache::new(Arc::new(uncompressed), false);
        assert_eq!(cache.get(&request).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupted_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = article("https://example.com/a");
        let store = FileStore::builder().cache_dir(dir.path()).build().unwrap();
        std::fs::write(store.entry_path(&cache_key(&request)), b"garbage").unwrap();

        let cache = ExtractionCache::new(Arc::new(store), false);
        assert!(matches!(
            cache.get(&request).await,
            Err(AutoExtractError::StoreError(_))
        ));
    }

    #[cfg(feature = "collection-cache")]
    #[tokio::test]
    async fn collection_store_round_trip() {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/1/s/dev_cache/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/collections/1/s/dev_cache/present"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"value": STANDARD.encode(b"bytes")})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/1/s/dev_cache"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = CollectionStore::new(&server.uri(), "1", "dev_cache", "key");
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(store.get("present").await.unwrap(), Some(b"bytes".to_vec()));
        store.put("new", b"value".to_vec()).await.unwrap();
    }
}
