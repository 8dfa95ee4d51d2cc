//! The backend query adapter interface, its registry and the server-side task registry.
//!
//! Adapters translate the semantic predicate and genotype constraint trees into their
//! native query representation.  Each adapter runs its scans as server-side tasks that
//! outlive an abandoned client request until they finish or are cancelled.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use enum_map::EnumMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    common::GenomeRelease,
    err::SearchError,
    search::{
        interpreter::{genotype::GenotypeConstraint, Predicate},
        schema::DatasetType,
        sorting::SortField,
    },
};

pub mod columnar;
pub mod index;

/// A genotype constraint with the name reported back for matching rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_new::new)]
pub struct NamedConstraint {
    /// Name reported back, the family id or the compound heterozygous name.
    pub name: String,
    /// The constraint.
    pub constraint: GenotypeConstraint,
}

/// Genotype part of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FamilyFilter {
    /// Rows must match at least one of the constraints; matched names are reported.
    Named(Vec<NamedConstraint>),
    /// Rows must show an alternate allele in any of the samples, given with their family.
    AnyAlt {
        sample_families: IndexMap<String, String>,
    },
}

impl FamilyFilter {
    /// Whether the inheritance filter is applied, i.e., matched names are reported.
    pub fn is_named(&self) -> bool {
        matches!(self, FamilyFilter::Named(_))
    }
}

/// How to execute a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    /// Return the sorted window of matching rows.
    Plain,
    /// Group matching rows by gene for compound heterozygous candidates.
    GeneAggregation {
        /// Return at most this many rows plus one per gene.
        max_per_gene: usize,
        /// Fail if more genes with at least two rows are found.
        max_genes: usize,
        /// Restrict buckets to these genes.
        gene_ids: Option<Vec<String>>,
    },
}

/// One query against one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Name of the data source.
    pub source_id: String,
    /// Variant-level predicate.
    pub predicate: Predicate,
    /// Genotype part.
    pub family_filter: FamilyFilter,
    /// Execution mode.
    pub mode: QueryMode,
    /// Offset of the window into the sorted result.
    pub offset: usize,
    /// Size of the window.
    pub limit: usize,
    /// Requested sort fields, the positional tie breaker is implied.
    pub sort: Vec<SortField>,
    /// Family ids in request order, for sorting by family.
    pub family_order: Vec<String>,
    /// Samples whose calls are returned.
    pub sample_ids: Vec<String>,
}

/// Sort values as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawSortValues {
    /// JSON numbers, infinities given as "Infinity" and "-Infinity".
    Json(Vec<serde_json::Value>),
    /// Order-preserving unsigned encodings of the key components.
    Unsigned(Vec<u64>),
}

/// Raw row of a backend, tagged with the schema it was written in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawRow {
    /// Inverted index document of the legacy schema.
    IndexLegacy(index::LegacyDocument),
    /// Inverted index document of the current schema.
    Index(index::Document),
    /// Row of a columnar table.
    Columnar(columnar::Row),
}

/// One returned row with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHit {
    /// The projected row.
    pub row: RawRow,
    /// Names of the matched genotype constraints.
    pub matched_constraints: Vec<String>,
    /// Sort key components in ascending order, without the tie breakers.
    pub sort_values: RawSortValues,
}

/// Rows of one gene bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneBucket {
    /// Gene identifier.
    pub gene_id: String,
    /// Best rows of the gene, sorted.
    pub hits: Vec<RawHit>,
}

/// Metadata of a data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct SourceInfo {
    /// Name of the data source.
    pub source_id: String,
    /// Genome build.
    pub genome_version: GenomeRelease,
    /// Dataset type.
    pub dataset_type: DatasetType,
}

/// Result of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// The data source.
    pub source: SourceInfo,
    /// Rows of the window, empty for gene aggregation.
    pub hits: Vec<RawHit>,
    /// Total number of matching rows.
    pub total: usize,
    /// Gene buckets for gene aggregation.
    pub gene_buckets: Vec<GeneBucket>,
    /// Whether the query was a gene aggregation.
    pub is_gene_aggregation: bool,
}

/// A server-side task as listed by `list_running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTask {
    /// Task identifier.
    pub id: uuid::Uuid,
    /// Data source the task scans.
    pub source_id: String,
    /// Time since start.
    pub age: Duration,
}

/// Capability interface of one backend.
#[async_trait::async_trait]
pub trait BackendQueryAdapter: Send + Sync {
    /// Name of the backend for logging.
    fn name(&self) -> &str;

    /// Metadata of the data source, `None` if the backend does not hold it.
    fn source(&self, source_id: &str) -> Option<SourceInfo>;

    /// Execute the query.
    async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, SearchError>;

    /// Enumerate the server-side tasks running for at least `min_age`.
    async fn list_running(&self, min_age: Duration) -> Vec<RunningTask>;

    /// Cancel the given server-side tasks, returning the number of cancelled tasks.
    async fn cancel(&self, ids: &[uuid::Uuid]) -> usize;
}

/// Fail if the window exceeds the maximal result window.
pub fn check_window(offset: usize, limit: usize, max_window: usize) -> Result<(), SearchError> {
    if offset + limit > max_window {
        Err(SearchError::TooManyResults {
            requested: offset + limit,
            max_window,
        })
    } else {
        Ok(())
    }
}

/// Finish a gene aggregation from the sorted matching rows of each gene.
///
/// Buckets are ordered by row count (descending) and gene id, and truncated to
/// `max_per_gene + 1` rows so callers can detect overflowing genes.  Genes with a single
/// row are kept as their partner may come from another data source but only genes with
/// at least two rows count towards `max_genes`.
pub fn finish_buckets<T, F>(
    buckets: IndexMap<String, Vec<T>>,
    max_per_gene: usize,
    max_genes: usize,
    to_hit: F,
) -> Result<Vec<GeneBucket>, SearchError>
where
    F: Fn(T) -> Result<RawHit, SearchError>,
{
    let count = buckets.values().filter(|rows| rows.len() >= 2).count();
    if count > max_genes {
        return Err(SearchError::TooManyGenes { count, max_genes });
    }

    let mut buckets: Vec<(String, Vec<T>)> = buckets.into_iter().collect();
    buckets.sort_by(|(a_gene, a_rows), (b_gene, b_rows)| {
        b_rows.len().cmp(&a_rows.len()).then_with(|| a_gene.cmp(b_gene))
    });
    buckets
        .into_iter()
        .map(|(gene_id, rows)| {
            Ok(GeneBucket {
                gene_id,
                hits: rows
                    .into_iter()
                    .take(max_per_gene + 1)
                    .map(&to_hit)
                    .collect::<Result<Vec<_>, _>>()?,
            })
        })
        .collect()
}

/// Map from dataset types to adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: EnumMap<DatasetType, Option<Arc<dyn BackendQueryAdapter>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<(DatasetType, &str)> = self
            .adapters
            .iter()
            .filter_map(|(dataset_type, adapter)| adapter.as_ref().map(|a| (dataset_type, a.name())))
            .collect();
        f.debug_struct("AdapterRegistry")
            .field("adapters", &names)
            .finish()
    }
}

impl AdapterRegistry {
    /// Register `adapter` for `dataset_type`.
    pub fn register(&mut self, dataset_type: DatasetType, adapter: Arc<dyn BackendQueryAdapter>) {
        self.adapters[dataset_type] = Some(adapter);
    }

    /// The adapter for the dataset type.
    pub fn get(&self, dataset_type: DatasetType) -> Option<&Arc<dyn BackendQueryAdapter>> {
        self.adapters[dataset_type].as_ref()
    }

    /// Resolve the adapter and source info for a sample's data source.
    pub fn resolve(
        &self,
        dataset_type: DatasetType,
        source_id: &str,
        family_id: &str,
    ) -> Result<(Arc<dyn BackendQueryAdapter>, SourceInfo), SearchError> {
        let missing = || SearchError::MissingDataSource {
            source_id: source_id.to_string(),
            family_id: family_id.to_string(),
        };
        let adapter = self.get(dataset_type).ok_or_else(missing)?;
        let source = adapter.source(source_id).ok_or_else(missing)?;
        Ok((adapter.clone(), source))
    }

    /// All registered adapters, de-duplicated by identity.
    pub fn adapters(&self) -> Vec<Arc<dyn BackendQueryAdapter>> {
        let mut result: Vec<Arc<dyn BackendQueryAdapter>> = Vec::new();
        for adapter in self.adapters.values().flatten() {
            if !result.iter().any(|a| Arc::ptr_eq(a, adapter)) {
                result.push(adapter.clone());
            }
        }
        result
    }
}

/// Book-keeping of one registered task.
#[derive(Debug)]
struct TaskEntry {
    source_id: String,
    started: Instant,
    cancelled: Arc<AtomicBool>,
}

/// Registry of the server-side tasks of one backend.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<IndexMap<uuid::Uuid, TaskEntry>>>,
}

impl TaskRegistry {
    /// Register a new task, it is removed when the returned handle is dropped.
    pub fn register(&self, source_id: &str) -> TaskHandle {
        let id = uuid::Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(
                id,
                TaskEntry {
                    source_id: source_id.to_string(),
                    started: Instant::now(),
                    cancelled: cancelled.clone(),
                },
            );
        }
        TaskHandle {
            id,
            cancelled,
            registry: self.clone(),
        }
    }

    /// Tasks running for at least `min_age`, oldest first.
    pub fn list_running(&self, min_age: Duration) -> Vec<RunningTask> {
        let Ok(tasks) = self.tasks.lock() else {
            return Vec::new();
        };
        let mut result: Vec<RunningTask> = tasks
            .iter()
            .map(|(id, entry)| RunningTask {
                id: *id,
                source_id: entry.source_id.clone(),
                age: entry.started.elapsed(),
            })
            .filter(|task| task.age >= min_age)
            .collect();
        result.sort_by(|a, b| b.age.cmp(&a.age));
        result
    }

    /// Flag the given tasks as cancelled, returning the number of known tasks.
    pub fn cancel(&self, ids: &[uuid::Uuid]) -> usize {
        let Ok(tasks) = self.tasks.lock() else {
            return 0;
        };
        let mut count = 0;
        for id in ids {
            if let Some(entry) = tasks.get(id) {
                entry.cancelled.store(true, Ordering::SeqCst);
                tracing::info!("cancelled task {} on {}", id, &entry.source_id);
                count += 1;
            }
        }
        count
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// Whether no task is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle of a running task.
#[derive(Debug)]
pub struct TaskHandle {
    id: uuid::Uuid,
    cancelled: Arc<AtomicBool>,
    registry: TaskRegistry,
}

impl TaskHandle {
    /// Task identifier.
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with a backend error if the task has been cancelled.
    pub fn check(&self, source_id: &str) -> Result<(), SearchError> {
        if self.is_cancelled() {
            Err(SearchError::Backend {
                source_id: source_id.to_string(),
                message: format!("task {} was cancelled", self.id),
            })
        } else {
            Ok(())
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.registry.tasks.lock() {
            tasks.shift_remove(&self.id);
        }
    }
}

/// Number of rows scanned between cancellation checks.
pub const SCAN_CHUNK_SIZE: usize = 256;

/// Adapter wrappers for tests.
#[cfg(test)]
pub mod testing {
    use super::*;

    /// Sleep for `latency` in small steps, failing early if the task is cancelled.
    pub async fn sleep_cancellable(
        handle: &TaskHandle,
        latency: Duration,
        source_id: &str,
    ) -> Result<(), SearchError> {
        let step = Duration::from_millis(10);
        let started = Instant::now();
        while started.elapsed() < latency {
            handle.check(source_id)?;
            tokio::time::sleep(step.min(latency.saturating_sub(started.elapsed()))).await;
        }
        handle.check(source_id)
    }

    /// Delays every execution of the wrapped adapter in a cancellable server-side task.
    pub struct SlowAdapter {
        inner: Arc<dyn BackendQueryAdapter>,
        latency: Duration,
        tasks: TaskRegistry,
    }

    impl SlowAdapter {
        pub fn new(inner: Arc<dyn BackendQueryAdapter>, latency: Duration) -> Self {
            Self {
                inner,
                latency,
                tasks: TaskRegistry::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl BackendQueryAdapter for SlowAdapter {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn source(&self, source_id: &str) -> Option<SourceInfo> {
            self.inner.source(source_id)
        }

        async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, SearchError> {
            let handle = self.tasks.register(&request.source_id);
            let inner = self.inner.clone();
            let request = request.clone();
            let latency = self.latency;
            let source_id = request.source_id.clone();
            tokio::spawn(async move {
                sleep_cancellable(&handle, latency, &request.source_id).await?;
                inner.execute(&request).await
            })
            .await
            .map_err(|e| SearchError::Backend {
                source_id,
                message: format!("task failed: {}", e),
            })?
        }

        async fn list_running(&self, min_age: Duration) -> Vec<RunningTask> {
            let mut tasks = self.tasks.list_running(min_age);
            tasks.extend(self.inner.list_running(min_age).await);
            tasks
        }

        async fn cancel(&self, ids: &[uuid::Uuid]) -> usize {
            self.tasks.cancel(ids) + self.inner.cancel(ids).await
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn window_check() {
        assert!(check_window(9_990, 10, 10_000).is_ok());
        assert_eq!(
            check_window(9_995, 10, 10_000),
            Err(SearchError::TooManyResults {
                requested: 10_005,
                max_window: 10_000
            })
        );
    }

    #[test]
    fn task_registry_lifecycle() {
        let registry = TaskRegistry::default();
        let handle = registry.register("idx");
        assert_eq!(registry.len(), 1);
        let running = registry.list_running(Duration::ZERO);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, handle.id());
        assert!(registry
            .list_running(Duration::from_secs(3600))
            .is_empty());

        assert!(!handle.is_cancelled());
        assert_eq!(registry.cancel(&[handle.id(), uuid::Uuid::new_v4()]), 1);
        assert!(handle.is_cancelled());
        assert!(matches!(
            handle.check("idx"),
            Err(SearchError::Backend { .. })
        ));

        drop(handle);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn latency_is_cancellable() {
        let registry = TaskRegistry::default();
        let handle = registry.register("idx");
        registry.cancel(&[handle.id()]);
        let result = testing::sleep_cancellable(&handle, Duration::from_secs(10), "idx").await;
        assert!(result.is_err());
    }
}
