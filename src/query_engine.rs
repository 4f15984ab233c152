//! Question answering over loaded indexes.
//!
//! Loaded indexes live in a small LRU cache keyed by document id rather than
//! a single "hot" slot, so concurrent queries against different documents
//! never evict each other mid-flight. A capacity of 1 behaves like a single
//! slot. The cache mutex guards only the map; loading and provider calls run
//! with it released, and callers hold an `Arc` to the index they query.
//!
//! All provider calls go through a circuit breaker and retry: one breaker
//! for loads and one for queries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{IndexError, IndexResult};
use crate::events::{EventBus, IndexEvent};
use crate::file_manager::FileManager;
use crate::models::VectorIndex;
use crate::provider::{IndexProvider, LoadedIndex};
use crate::resilience::{guarded, CircuitBreaker, Retry};
use crate::store::MetadataStore;

/// An answer plus how long it took, including any implicit load.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub document_id: i64,
    pub answer: String,
    pub elapsed: Duration,
}

/// Read-only view of one document's index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub document_id: i64,
    pub exists: bool,
    pub verified: bool,
    pub index_path: Option<std::path::PathBuf>,
    pub chunk_count: usize,
    pub created_at: Option<i64>,
    /// Currently held in the query cache.
    pub loaded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub loads: u64,
    pub load_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub queries: u64,
    pub query_failures: u64,
    /// Most recently used first.
    pub loaded_documents: Vec<i64>,
    pub capacity: usize,
}

struct Hot {
    record: VectorIndex,
    index: Arc<LoadedIndex>,
}

/// Fixed-capacity LRU of loaded indexes.
///
/// Every removal bumps the document's generation and every `clear` bumps
/// the epoch. A load remembers the generation it started under and only
/// caches its result if nothing was invalidated in between.
struct IndexCache {
    cap: usize,
    map: HashMap<i64, Hot>,
    /// Least recently used first.
    order: Vec<i64>,
    generations: HashMap<i64, u64>,
    epoch: u64,
}

impl IndexCache {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            map: HashMap::new(),
            order: Vec::new(),
            generations: HashMap::new(),
            epoch: 0,
        }
    }

    fn generation(&self, id: i64) -> (u64, u64) {
        (self.epoch, self.generations.get(&id).copied().unwrap_or(0))
    }

    fn touch(&mut self, id: i64) {
        self.order.retain(|k| *k != id);
        self.order.push(id);
    }

    fn get(&mut self, id: i64) -> Option<Arc<LoadedIndex>> {
        let index = self.map.get(&id).map(|hot| hot.index.clone())?;
        self.touch(id);
        Some(index)
    }

    /// Insert or replace; returns the ids evicted to stay within capacity.
    fn insert(&mut self, id: i64, hot: Hot) -> Vec<i64> {
        self.map.insert(id, hot);
        self.touch(id);

        let mut evicted = Vec::new();
        while self.map.len() > self.cap && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.map.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    /// Like `insert`, but `None` when `id` was invalidated since `seen`.
    fn insert_if_current(&mut self, id: i64, seen: (u64, u64), hot: Hot) -> Option<Vec<i64>> {
        if self.generation(id) != seen {
            return None;
        }
        Some(self.insert(id, hot))
    }

    fn remove(&mut self, id: i64) -> bool {
        *self.generations.entry(id).or_default() += 1;
        self.order.retain(|k| *k != id);
        self.map.remove(&id).is_some()
    }

    fn clear(&mut self) -> Vec<i64> {
        self.epoch += 1;
        self.map.clear();
        std::mem::take(&mut self.order)
    }

    fn contains(&self, id: i64) -> bool {
        self.map.contains_key(&id)
    }

    fn mru_first(&self) -> Vec<i64> {
        self.order.iter().rev().copied().collect()
    }
}

pub struct QueryEngine {
    store: Arc<dyn MetadataStore>,
    files: FileManager,
    provider: Arc<dyn IndexProvider>,
    cache: Mutex<IndexCache>,
    load_breaker: Arc<CircuitBreaker>,
    query_breaker: Arc<CircuitBreaker>,
    retry: Arc<Retry>,
    events: EventBus,
    stats: Mutex<QueryStats>,
}

impl QueryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        files: FileManager,
        provider: Arc<dyn IndexProvider>,
        capacity: usize,
        load_breaker: Arc<CircuitBreaker>,
        query_breaker: Arc<CircuitBreaker>,
        retry: Arc<Retry>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            files,
            provider,
            cache: Mutex::new(IndexCache::new(capacity)),
            load_breaker,
            query_breaker,
            retry,
            events,
            stats: Mutex::new(QueryStats::default()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, IndexCache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, f: impl FnOnce(&mut QueryStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    pub fn load_breaker(&self) -> &CircuitBreaker {
        &self.load_breaker
    }

    pub fn query_breaker(&self) -> &CircuitBreaker {
        &self.query_breaker
    }

    /// Load the index for `document_id` into the cache, replacing any
    /// cached copy.
    pub async fn load(&self, document_id: i64) -> IndexResult<Arc<LoadedIndex>> {
        let result = self.load_uncached(document_id).await;
        match &result {
            Ok(_) => self.record(|s| s.loads += 1),
            Err(e) => {
                self.record(|s| s.load_failures += 1);
                tracing::warn!(document_id, error = %e, "index load failed");
            }
        }
        result
    }

    async fn load_uncached(&self, document_id: i64) -> IndexResult<Arc<LoadedIndex>> {
        // read before the record so a rebuild landing mid-load is noticed
        let seen = self.cache().generation(document_id);
        let record = self
            .store
            .get_vector_index(document_id)
            .await?
            .ok_or_else(|| IndexError::IndexLoad {
                document_id,
                reason: "no index has been built for this document".to_string(),
            })?;

        let path = record.index_path.clone();
        let files = self.files.clone();
        let verified = tokio::task::spawn_blocking(move || files.verify(&path)).await?;
        if !verified {
            return Err(IndexError::IndexLoad {
                document_id,
                reason: format!(
                    "index files at {} failed verification",
                    record.index_path.display()
                ),
            });
        }

        let loaded = guarded(&self.load_breaker, &self.retry, || {
            self.provider.load(&record.index_path)
        })
        .await
        .map_err(|e| match e {
            IndexError::CircuitOpen { .. } | IndexError::Cancelled => e,
            other => IndexError::IndexLoad {
                document_id,
                reason: other.to_string(),
            },
        })?;

        let index = Arc::new(loaded);
        let inserted = self.cache().insert_if_current(
            document_id,
            seen,
            Hot {
                record,
                index: index.clone(),
            },
        );

        let Some(evicted) = inserted else {
            tracing::debug!(document_id, "index replaced during load, not caching");
            return Ok(index);
        };
        tracing::info!(document_id, nodes = index.len(), "index loaded");
        self.events.emit(IndexEvent::Loaded { document_id });
        self.note_evictions(&evicted);
        Ok(index)
    }

    fn note_evictions(&self, evicted: &[i64]) {
        if evicted.is_empty() {
            return;
        }
        self.record(|s| s.evictions += evicted.len() as u64);
        for &document_id in evicted {
            tracing::debug!(document_id, "evicted from query cache");
            self.events.emit(IndexEvent::Evicted { document_id });
        }
    }

    /// `true` when the index loaded.
    pub async fn try_load(&self, document_id: i64) -> bool {
        self.load(document_id).await.is_ok()
    }

    async fn ensure_loaded(&self, document_id: i64) -> IndexResult<Arc<LoadedIndex>> {
        let cached = self.cache().get(document_id);
        match cached {
            Some(index) => {
                self.record(|s| s.cache_hits += 1);
                Ok(index)
            }
            None => {
                self.record(|s| s.cache_misses += 1);
                self.load(document_id).await
            }
        }
    }

    /// Answer `text` against the document's index, loading it first when
    /// it is not cached.
    pub async fn query(&self, document_id: i64, text: &str) -> IndexResult<QueryAnswer> {
        let started = Instant::now();
        let result = self.query_inner(document_id, text, started).await;
        self.record(|s| {
            s.queries += 1;
            if result.is_err() {
                s.query_failures += 1;
            }
        });
        result
    }

    async fn query_inner(
        &self,
        document_id: i64,
        text: &str,
        started: Instant,
    ) -> IndexResult<QueryAnswer> {
        if text.trim().is_empty() {
            let mut report = crate::error::ValidationReport::new();
            report.error("query text is empty", "Ask a question with at least one word");
            return Err(IndexError::Validation(report));
        }

        let index = self
            .ensure_loaded(document_id)
            .await
            .map_err(|e| match e {
                IndexError::CircuitOpen { .. } | IndexError::Cancelled => e,
                other => IndexError::QueryExecution {
                    document_id,
                    reason: format!("no index loaded: {}", other),
                },
            })?;

        let answer = guarded(&self.query_breaker, &self.retry, || {
            self.provider.query(&index, text)
        })
        .await
        .map_err(|e| match e {
            IndexError::CircuitOpen { .. } | IndexError::Cancelled => e,
            other => IndexError::QueryExecution {
                document_id,
                reason: other.to_string(),
            },
        })?;

        let elapsed = started.elapsed();
        tracing::debug!(document_id, ms = elapsed.as_millis() as u64, "query answered");
        Ok(QueryAnswer {
            document_id,
            answer,
            elapsed,
        })
    }

    /// Report on a document's index without loading or evicting anything.
    pub async fn status(&self, document_id: i64) -> IndexResult<IndexStatus> {
        let loaded = self.cache().contains(document_id);
        let Some(record) = self.store.get_vector_index(document_id).await? else {
            return Ok(IndexStatus {
                document_id,
                exists: false,
                verified: false,
                index_path: None,
                chunk_count: 0,
                created_at: None,
                loaded,
            });
        };

        let files = self.files.clone();
        let path = record.index_path.clone();
        let verified = tokio::task::spawn_blocking(move || files.verify(&path)).await?;

        Ok(IndexStatus {
            document_id,
            exists: true,
            verified,
            index_path: Some(record.index_path),
            chunk_count: record.chunk_count,
            created_at: Some(record.created_at),
            loaded,
        })
    }

    /// Drop one document from the cache.
    pub fn evict(&self, document_id: i64) -> bool {
        let removed = self.cache().remove(document_id);
        if removed {
            self.note_evictions(&[document_id]);
        }
        removed
    }

    /// Drop every cached index.
    pub fn clear(&self) {
        let evicted = self.cache().clear();
        self.note_evictions(&evicted);
    }

    /// The most recently used document, if any index is loaded.
    pub fn current_document_id(&self) -> Option<i64> {
        self.cache().order.last().copied()
    }

    /// The record the cached index for `document_id` was loaded from.
    pub fn cached_record(&self, document_id: i64) -> Option<VectorIndex> {
        self.cache().map.get(&document_id).map(|h| h.record.clone())
    }

    pub fn stats(&self) -> QueryStats {
        let (loaded_documents, capacity) = {
            let cache = self.cache();
            (cache.mru_first(), cache.cap)
        };
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.loaded_documents = loaded_documents;
        stats.capacity = capacity;
        stats
    }
}
