//! Pagination state of a search and the cache it is persisted in.
//!
//! `CursorState` holds everything loaded so far: the contiguous result list from offset
//! 0, the rows loaded from each data source that could not be placed yet, and the
//! compound heterozygous pairs that have not been returned yet.  `plan` decides whether a
//! page can be served from the state or which windows need loading, `apply` folds the
//! loaded rows into the state.

use std::{collections::HashMap, path::Path, sync::Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    common::{sha256_hex, GenomeRelease},
    err::SearchError,
    search::{
        dedup::{deduplicate, merge_into_existing, DedupCounters},
        schema::{ResultItem, SearchRequest, VariantRecord},
        sorting::SortKey,
    },
};

/// Loading progress of one data source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceProgress {
    /// Number of rows loaded.
    pub loaded: usize,
    /// Total number of matching rows, once known.
    pub total: Option<usize>,
    /// Sort key of the last loaded row.
    pub last_key: Option<SortKey>,
}

impl SourceProgress {
    /// Whether all rows have been loaded.
    pub fn is_exhausted(&self) -> bool {
        self.total.map_or(false, |total| self.loaded >= total)
    }
}

/// Persisted pagination state of one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    /// Cache key of the search the state belongs to.
    pub key: String,
    /// Results from offset 0, in sort order.
    pub all_results: Vec<ResultItem>,
    /// Total number of results, once known.
    pub total_results: Option<usize>,
    /// Progress of each data source of plain queries.
    pub sources: IndexMap<String, SourceProgress>,
    /// Loaded single variants not yet placed into `all_results`.
    pub pending: Vec<VariantRecord>,
    /// All compound heterozygous pairs, once loaded.
    pub comp_het_results: Option<Vec<ResultItem>>,
    /// Number of pairs of `comp_het_results` placed into `all_results`.
    pub comp_het_placed: usize,
    /// Number of merged duplicates.
    pub duplicate_count: usize,
}

impl CursorState {
    /// Fresh state for the search with cache key `key` over the given data sources.
    pub fn new(key: &str, source_ids: &[String]) -> Self {
        Self {
            key: key.to_string(),
            sources: source_ids
                .iter()
                .map(|source_id| (source_id.clone(), SourceProgress::default()))
                .collect(),
            ..Default::default()
        }
    }

    /// Whether every result has been placed.
    pub fn is_complete(&self, mode: CursorMode) -> bool {
        let comp_het_done = match mode {
            CursorMode::CompoundHet => self
                .comp_het_results
                .as_ref()
                .map_or(false, |pairs| self.comp_het_placed >= pairs.len()),
            CursorMode::Single | CursorMode::MultiSource => true,
        };
        comp_het_done
            && self.pending.is_empty()
            && self.sources.values().all(SourceProgress::is_exhausted)
    }

    /// The slice `[start, end)` of the results, clamped.
    pub fn page(&self, start: usize, end: usize) -> Vec<ResultItem> {
        let end = end.min(self.all_results.len());
        let start = start.min(end);
        self.all_results[start..end].to_vec()
    }
}

/// How the results of a search are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorMode {
    /// Plain query against one data source.
    Single,
    /// Plain queries against several data sources.
    MultiSource,
    /// Gene aggregation queries for compound heterozygous pairs, plus plain queries for
    /// single variants if `sources` is not empty.
    CompoundHet,
}

/// Window of rows to load from one data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceWindow {
    pub offset: usize,
    pub limit: usize,
}

/// Parameters of the next load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    /// Whether a single plain query is issued.
    pub is_single_query: bool,
    /// Windows of the plain queries by data source.
    pub windows: IndexMap<String, SourceWindow>,
    /// Whether the compound heterozygous pairs must be loaded.
    pub load_comp_het: bool,
    /// Number of results that `all_results` must hold to serve the page.
    pub end: usize,
}

/// Outcome of planning a page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// The page is served from the state.
    Cached { start: usize, end: usize },
    /// Rows must be loaded first.
    Load(LoadPlan),
}

/// Plan serving results `[start, end)`.
///
/// Loads always continue at the current offset of each source so `all_results` stays
/// contiguous.
pub fn plan(state: &CursorState, start: usize, end: usize, mode: CursorMode) -> Plan {
    if state.all_results.len() >= end || state.is_complete(mode) {
        return Plan::Cached { start, end };
    }
    let need = end - state.all_results.len();
    let windows: IndexMap<String, SourceWindow> = state
        .sources
        .iter()
        .filter(|(_, progress)| !progress.is_exhausted())
        .map(|(source_id, progress)| {
            (
                source_id.clone(),
                SourceWindow {
                    offset: progress.loaded,
                    limit: need,
                },
            )
        })
        .collect();
    Plan::Load(LoadPlan {
        is_single_query: mode == CursorMode::Single,
        windows,
        load_comp_het: mode == CursorMode::CompoundHet && state.comp_het_results.is_none(),
        end,
    })
}

/// Rows returned by the backends for one load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedRows {
    /// Normalized rows (in sort order) and total count by data source.
    pub sources: IndexMap<String, (Vec<VariantRecord>, usize)>,
    /// The compound heterozygous pairs, if loaded.
    pub comp_het: Option<Vec<ResultItem>>,
}

/// Fold loaded rows into the state and place results up to `end`.
pub fn apply(
    mut state: CursorState,
    loaded: LoadedRows,
    end: usize,
    search_build: GenomeRelease,
) -> CursorState {
    let mut fresh = Vec::new();
    for (source_id, (records, total)) in loaded.sources {
        let progress = state.sources.entry(source_id).or_default();
        progress.loaded += records.len();
        progress.total = Some(total);
        if let Some(last) = records.last() {
            progress.last_key = Some(last.sort_key.clone());
        }
        fresh.extend(records);
    }
    if let Some(pairs) = loaded.comp_het {
        state.comp_het_results = Some(pairs);
    }

    // De-duplicate the new rows among themselves, against the pending rows and against
    // the results already placed.
    let mut counters = DedupCounters::default();
    let mut candidates = std::mem::take(&mut state.pending);
    candidates.extend(fresh);
    candidates.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
    let candidates = deduplicate(candidates, search_build, &mut counters);
    for record in candidates {
        let placed = state.all_results.iter_mut().filter_map(|item| match item {
            ResultItem::Single(record) => Some(record.as_mut()),
            ResultItem::CompoundHet(_) => None,
        });
        if let Some(record) = merge_into_existing(placed, record, &mut counters) {
            state.pending.push(record);
        }
    }
    state.duplicate_count += counters.duplicates;

    // Rows sorting after the last loaded row of a source that is not exhausted may still
    // be preceded by rows not loaded yet.
    let frontier: Option<SortKey> = state
        .sources
        .values()
        .filter(|progress| !progress.is_exhausted())
        .filter_map(|progress| progress.last_key.clone())
        .min();
    let blocked = state
        .sources
        .values()
        .any(|progress| !progress.is_exhausted() && progress.last_key.is_none());
    let is_placeable = |key: &SortKey| !blocked && frontier.as_ref().map_or(true, |f| key <= f);

    let mut pending = std::mem::take(&mut state.pending).into_iter().peekable();
    let pairs = state.comp_het_results.clone().unwrap_or_default();
    let mut pairs_iter = pairs.into_iter().skip(state.comp_het_placed).peekable();
    let mut rest = Vec::new();
    while state.all_results.len() < end {
        let next_single = pending.peek().map(|record| record.sort_key.clone());
        let next_pair = pairs_iter.peek().map(|item| item.sort_key().clone());
        let take_pair = match (&next_single, &next_pair) {
            (Some(single), Some(pair)) => pair <= single,
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if take_pair {
            match (next_pair, pairs_iter.next()) {
                (Some(key), Some(item)) if is_placeable(&key) => {
                    state.all_results.push(item);
                    state.comp_het_placed += 1;
                }
                _ => break,
            }
        } else {
            match (next_single, pending.next()) {
                (Some(key), Some(record)) if is_placeable(&key) => {
                    state.all_results.push(ResultItem::Single(Box::new(record)));
                }
                (_, Some(record)) => {
                    rest.push(record);
                    break;
                }
                _ => break,
            }
        }
    }
    rest.extend(pending);
    state.pending = rest;

    let source_totals: Option<usize> = state.sources.values().map(|p| p.total).sum();
    let comp_het_total = state.comp_het_results.as_ref().map_or(0, Vec::len);
    state.total_results = source_totals
        .map(|singles| (singles + comp_het_total).saturating_sub(state.duplicate_count));
    state
}

/// The cache key of a search.
///
/// Derived from the full search specification, the searched families and samples, and
/// the sort option, so any change to them starts a fresh cursor.
pub fn cache_key(request: &SearchRequest) -> Result<String, SearchError> {
    #[derive(Serialize)]
    struct KeyPayload<'a> {
        search: &'a crate::search::schema::SearchSpec,
        family_ids: Vec<&'a str>,
        sample_ids: Vec<&'a str>,
    }
    let payload = KeyPayload {
        search: &request.search,
        family_ids: request.families.iter().map(|f| f.family_id.as_str()).collect(),
        sample_ids: request.samples.iter().map(|s| s.sample_id.as_str()).collect(),
    };
    let digest = sha256_hex(&serde_json::to_vec(&payload)?);
    Ok(format!("search__{}__{}", digest, request.sort))
}

/// Key/value store of cursor states with optimistic concurrency.
#[async_trait::async_trait]
pub trait PaginationCache: Send + Sync {
    /// The state and its version, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<(CursorState, u64)>, SearchError>;

    /// Store `state` unconditionally, returning the new version.
    async fn set(&self, key: &str, state: &CursorState) -> Result<u64, SearchError>;

    /// Store `state` if the current version is `expected` (`None` for absent).
    ///
    /// Returns whether the state was stored.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CursorState,
    ) -> Result<bool, SearchError>;
}

/// One entry of the in-memory cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    version: u64,
    value: serde_json::Value,
}

/// In-memory cache of JSON values, can be persisted to a file.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    /// Load from a JSON file written by `save`, empty if the file does not exist.
    #[tracing::instrument]
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        if !path.exists() {
            tracing::debug!("no cache file at {:?}, starting empty", path);
            return Ok(Self::default());
        }
        let entries: HashMap<String, CacheEntry> =
            serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(path)?))?;
        tracing::debug!("loaded {} cache entries", entries.len());
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Write all entries to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        serde_json::to_writer(std::io::BufWriter::new(std::fs::File::create(path)?), &*entries)?;
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
        key: &str,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>, SearchError> {
        self.entries.lock().map_err(|e| SearchError::Cache {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl PaginationCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<(CursorState, u64)>, SearchError> {
        let entries = self.lock(key)?;
        match entries.get(key) {
            Some(entry) => Ok(Some((
                serde_json::from_value(entry.value.clone())?,
                entry.version,
            ))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, state: &CursorState) -> Result<u64, SearchError> {
        let value = serde_json::to_value(state)?;
        let mut entries = self.lock(key)?;
        let version = entries.get(key).map_or(1, |entry| entry.version + 1);
        entries.insert(key.to_string(), CacheEntry { version, value });
        Ok(version)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CursorState,
    ) -> Result<bool, SearchError> {
        let value = serde_json::to_value(state)?;
        let mut entries = self.lock(key)?;
        let current = entries.get(key).map(|entry| entry.version);
        if current != expected {
            return Ok(false);
        }
        let version = current.map_or(1, |v| v + 1);
        entries.insert(key.to_string(), CacheEntry { version, value });
        Ok(true)
    }
}
