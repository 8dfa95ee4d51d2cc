//! Runs one page request of a search through all the stages.
//!
//! The constraints and predicates are built per data source, the queries are fanned out
//! to the backend adapters behind a barrier, the rows are normalized and de-duplicated,
//! compound heterozygous pairs are built from the gene buckets and the result is merged
//! into the pagination cursor.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::{
    common::GenomeRelease,
    err::SearchError,
    search::{
        backend::{
            AdapterRegistry, BackendQueryAdapter, FamilyFilter, NamedConstraint, QueryMode,
            QueryRequest, QueryResponse, SourceInfo,
        },
        comp_het::{pair_compound_hets, PairingFamily, PairingSettings},
        cursor::{self, CursorMode, CursorState, LoadPlan, LoadedRows, PaginationCache, Plan},
        dedup::{deduplicate, DedupCounters},
        interpreter::{
            self, consequences,
            genotype::{comp_het_name, compile, CompileSettings},
            locus::{comp_het_gene_ids, locus_predicate},
            quality, Predicate, PredicateSettings,
        },
        liftover::CoordinateMapper,
        lookup::{FamilyIndex, GeneLookup},
        normalize::{normalize, NormalizeContext},
        schema::{DatasetType, Family, ResultItem, Sample, SearchRequest, VariantRecord},
        sorting::SortField,
    },
};

/// Fixed thresholds of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximal number of results that can be loaded for one search.
    pub max_result_window: usize,
    /// Maximal page size, larger requests are capped.
    pub max_page_size: usize,
    /// Maximal number of genes with compound heterozygous candidates.
    pub max_compound_het_genes: usize,
    /// Genes with more compound heterozygous candidates are skipped.
    pub max_variants_per_gene: usize,
    /// Maximal number of families of a compound heterozygous search without location.
    pub max_comp_het_families_no_location: usize,
    /// Timeout of one fan-out round.
    pub query_timeout_secs: u64,
    /// Tasks running at least this long are cancelled on timeout.
    pub long_running_threshold_secs: u64,
    /// Frequency up to which known pathogenic variants pass stricter cutoffs.
    pub pathogenic_override_af: f64,
    /// Population of the pathogenic frequency override.
    pub pathogenic_override_population: String,
    /// Number of retries when the cursor was updated concurrently.
    pub cache_cas_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_result_window: 10_000,
            max_page_size: 100,
            max_compound_het_genes: 1_000,
            max_variants_per_gene: 100,
            max_comp_het_families_no_location: 100,
            query_timeout_secs: 300,
            long_running_threshold_secs: 300,
            pathogenic_override_af: 0.05,
            pathogenic_override_population: String::from("gnomad_genomes"),
            cache_cas_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Settings for the predicate builder.
    pub fn predicate_settings(&self) -> PredicateSettings {
        PredicateSettings {
            pathogenic_override_af: self.pathogenic_override_af,
            pathogenic_override_population: self.pathogenic_override_population.clone(),
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    /// The results of the page.
    pub results: Vec<ResultItem>,
    /// Total number of results of the search.
    pub total_results: usize,
}

/// Counts of one gene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneCount {
    /// Number of variants.
    pub total: usize,
    /// Number of variants by family.
    pub families: IndexMap<String, usize>,
}

/// Stages of a page request, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum Phase {
    BuildingPredicates,
    Executing,
    Normalizing,
    Deduplicating,
    CompoundHetPairing,
    Paginated,
}

fn enter(phase: Phase) {
    tracing::debug!("search phase: {}", phase);
}

/// The queries to run against one data source.
struct SourcePlan {
    adapter: Arc<dyn BackendQueryAdapter>,
    source: SourceInfo,
    /// Variant predicate of the plain query.
    predicate: Predicate,
    /// Variant predicate of the gene aggregation query, also admitting the secondary
    /// consequences.
    comp_het_predicate: Predicate,
    /// Genotype filter of the plain query, `None` if no plain query is run.
    plain_filter: Option<FamilyFilter>,
    /// Genotype filter of the gene aggregation query, `None` if none is run.
    comp_het_filter: Option<FamilyFilter>,
    sample_ids: Vec<String>,
}

/// A search request prepared for execution.
struct PreparedSearch {
    key: String,
    sources: IndexMap<String, SourcePlan>,
    sort: Vec<SortField>,
    family_order: Vec<String>,
    family_index: FamilyIndex,
    search_build: GenomeRelease,
    mode: CursorMode,
    pairing_families: IndexMap<String, PairingFamily>,
    pairing: PairingSettings,
    comp_het_gene_ids: Option<Vec<String>>,
}

impl PreparedSearch {
    fn plain_source_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|(_, plan)| plan.plain_filter.is_some())
            .map(|(source_id, _)| source_id.clone())
            .collect()
    }
}

/// Kind of one sub-query of a fan-out round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Plain,
    GeneAggregation,
}

/// One sub-query of a fan-out round.
struct Job {
    kind: JobKind,
    adapter: Arc<dyn BackendQueryAdapter>,
    request: QueryRequest,
    named_constraints: bool,
}

/// Fail if the samples of one family and dataset type span several builds.
fn check_builds(families: &[Family], samples: &[Sample]) -> Result<(), SearchError> {
    for family in families {
        let mut builds: IndexMap<DatasetType, Vec<GenomeRelease>> = IndexMap::new();
        for sample in samples.iter().filter(|sample| {
            family
                .individuals
                .iter()
                .any(|ind| ind.individual_id == sample.individual_id)
        }) {
            let entry = builds.entry(sample.dataset_type).or_default();
            if !entry.contains(&sample.genome_version) {
                entry.push(sample.genome_version);
            }
        }
        if let Some((dataset_type, builds)) = builds.iter().find(|(_, builds)| builds.len() > 1) {
            return Err(SearchError::MixedGenomeBuilds {
                family_id: family.family_id.clone(),
                dataset_type: dataset_type.to_string(),
                builds: builds.iter().map(|b| b.to_string()).collect(),
            });
        }
    }
    Ok(())
}

/// The search engine, holding the adapters, lookups and the pagination cache.
pub struct SearchEngine {
    registry: AdapterRegistry,
    genes: Arc<dyn GeneLookup>,
    mapper: Arc<dyn CoordinateMapper>,
    cache: Arc<dyn PaginationCache>,
    config: EngineConfig,
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl SearchEngine {
    /// Construct the engine.
    pub fn new(
        registry: AdapterRegistry,
        genes: Arc<dyn GeneLookup>,
        mapper: Arc<dyn CoordinateMapper>,
        cache: Arc<dyn PaginationCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            genes,
            mapper,
            cache,
            config,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Return page `page` (1-based) of the search.
    ///
    /// With `load_all`, all results are returned, failing if there are more than fit into
    /// the result window.
    pub async fn search(
        &self,
        request: &SearchRequest,
        page: usize,
        page_size: usize,
        load_all: bool,
    ) -> Result<SearchPage, SearchError> {
        if page == 0 || page_size == 0 {
            return Err(SearchError::InvalidConfiguration {
                field: String::from("page"),
                message: format!("page {} of size {} is invalid", page, page_size),
            });
        }
        let page_size = if page_size > self.config.max_page_size && !load_all {
            tracing::debug!(
                "capping page size {} to {}",
                page_size,
                self.config.max_page_size
            );
            self.config.max_page_size
        } else {
            page_size
        };
        let (start, end) = if load_all {
            (0, self.config.max_result_window)
        } else {
            ((page - 1) * page_size, page * page_size)
        };

        enter(Phase::BuildingPredicates);
        let prepared = self.prepare(request)?;
        let span = tracing::info_span!("search", key = %prepared.key, page);
        self.paginate(&prepared, start, end, load_all)
            .instrument(span)
            .await
    }

    /// Read-modify-write the cursor of the search and return results `[start, end)`.
    async fn paginate(
        &self,
        prepared: &PreparedSearch,
        start: usize,
        end: usize,
        load_all: bool,
    ) -> Result<SearchPage, SearchError> {
        for attempt in 0..=self.config.cache_cas_retries {
            let (state, version) = match self.cache.get(&prepared.key).await? {
                Some((state, version)) if state.key == prepared.key => (state, Some(version)),
                Some((_, version)) => {
                    tracing::warn!("discarding stale cursor for {}", &prepared.key);
                    (
                        CursorState::new(&prepared.key, &prepared.plain_source_ids()),
                        Some(version),
                    )
                }
                None => (
                    CursorState::new(&prepared.key, &prepared.plain_source_ids()),
                    None,
                ),
            };
            let (state, changed) = self.advance(prepared, state, start, end, load_all).await?;
            if load_all {
                if let Some(total) = state.total_results {
                    if total > self.config.max_result_window {
                        return Err(SearchError::TooManyResults {
                            requested: total,
                            max_window: self.config.max_result_window,
                        });
                    }
                }
            }

            if !changed
                || self
                    .cache
                    .compare_and_set(&prepared.key, version, &state)
                    .await?
            {
                enter(Phase::Paginated);
                let results = state.page(start, end);
                tracing::info!(
                    "returning {} of {} results",
                    results.len(),
                    state.total_results.unwrap_or_default()
                );
                return Ok(SearchPage {
                    results,
                    total_results: state.total_results.unwrap_or_default(),
                });
            }
            tracing::debug!(
                "cursor {} was updated concurrently (attempt {})",
                &prepared.key,
                attempt + 1
            );
        }
        Err(SearchError::Cache {
            key: prepared.key.clone(),
            message: format!(
                "cursor was updated concurrently {} times",
                self.config.cache_cas_retries + 1
            ),
        })
    }

    /// Count the variants of all results of the search per gene and family.
    pub async fn gene_counts(
        &self,
        request: &SearchRequest,
    ) -> Result<IndexMap<String, GeneCount>, SearchError> {
        let page = self
            .search(request, 1, self.config.max_result_window, true)
            .await?;
        let mut seen = std::collections::HashSet::new();
        let mut result: IndexMap<String, GeneCount> = IndexMap::new();
        for variant in page.results.iter().flat_map(ResultItem::variants) {
            let gene_ids: Vec<&String> = match &variant.comp_het_gene_id {
                Some(gene_id) => vec![gene_id],
                None => variant.transcripts.keys().collect(),
            };
            for gene_id in gene_ids {
                if !seen.insert((gene_id.clone(), variant.variant_id.clone())) {
                    continue;
                }
                let count = result.entry(gene_id.clone()).or_default();
                count.total += 1;
                for family_id in &variant.family_ids {
                    *count.families.entry(family_id.clone()).or_default() += 1;
                }
            }
        }
        Ok(result)
    }

    /// Compile constraints and predicates for each data source of the request.
    fn prepare(&self, request: &SearchRequest) -> Result<PreparedSearch, SearchError> {
        let spec = &request.search;
        let family_index = FamilyIndex::new(&request.families, &request.samples)?;
        let mode = spec.inheritance.mode;
        let is_comp_het = mode.map_or(false, |mode| mode.is_comp_het());

        if is_comp_het
            && !spec.locus.has_location()
            && request.families.len() > self.config.max_comp_het_families_no_location
        {
            return Err(SearchError::TooManyFamilies {
                count: request.families.len(),
                max_families: self.config.max_comp_het_families_no_location,
            });
        }
        check_builds(&request.families, &request.samples)?;

        let consequence_terms = spec.consequence_terms();
        let secondary_terms = spec.secondary_consequence_terms();
        let annotation = interpreter::build(
            &consequence_terms,
            None,
            &spec.pathogenicity,
            &spec.frequencies,
            spec.in_silico.as_ref(),
            &self.config.predicate_settings(),
        )?;
        // Secondary consequences only qualify the second variant of a pair.
        let comp_het_annotation = match secondary_terms.as_deref() {
            Some(secondary) if is_comp_het => interpreter::build(
                &consequence_terms,
                Some(secondary),
                &spec.pathogenicity,
                &spec.frequencies,
                spec.in_silico.as_ref(),
                &self.config.predicate_settings(),
            )?,
            _ => annotation.clone(),
        };
        let vcf_filter = quality::vcf_filter_predicate(&spec.quality_filter);
        let with_sv = request
            .samples
            .iter()
            .any(|sample| sample.dataset_type == DatasetType::Sv);

        let mut by_source: IndexMap<&str, Vec<&Sample>> = IndexMap::new();
        for sample in &request.samples {
            by_source
                .entry(sample.data_source.as_str())
                .or_default()
                .push(sample);
        }

        let mut sources = IndexMap::new();
        let mut pairing_families = IndexMap::new();
        for (source_id, samples) in by_source {
            let first = samples[0];
            let first_family = family_index
                .sample(&first.sample_id)
                .map(|membership| membership.family_id.clone())
                .unwrap_or_default();
            let (adapter, source) =
                self.registry
                    .resolve(first.dataset_type, source_id, &first_family)?;

            let family_samples: Vec<(&Family, Vec<&Sample>)> = request
                .families
                .iter()
                .map(|family| {
                    let members: Vec<&Sample> = samples
                        .iter()
                        .copied()
                        .filter(|sample| {
                            family_index
                                .sample(&sample.sample_id)
                                .map_or(false, |m| m.family_id == family.family_id)
                        })
                        .collect();
                    (family, members)
                })
                .filter(|(_, members)| !members.is_empty())
                .collect();
            let settings = CompileSettings::new(
                source.dataset_type,
                with_sv && source.dataset_type == DatasetType::SnvIndel,
            );
            let constraints = compile(
                mode,
                &family_samples,
                &spec.inheritance.filter,
                &spec.quality_filter,
                &settings,
            )?;
            if constraints.is_empty() {
                tracing::debug!("no searchable family on data source {}", source_id);
                continue;
            }

            let locus = locus_predicate(
                &spec.locus,
                source.genome_version,
                self.genes.as_ref(),
                self.mapper.as_ref(),
            )?;
            let with_annotation = |annotation: &Predicate| {
                let mut parts = vec![annotation.clone(), vcf_filter.clone()];
                parts.extend(locus.clone());
                parts.extend(spec.custom_query.clone());
                Predicate::and(parts)
            };
            let predicate = with_annotation(&annotation);
            let comp_het_predicate = with_annotation(&comp_het_annotation);

            let plain_named: Vec<NamedConstraint> = constraints
                .values()
                .filter_map(|c| {
                    c.primary
                        .as_ref()
                        .map(|primary| NamedConstraint::new(c.family_id.clone(), primary.clone()))
                })
                .collect();
            let comp_het_named: Vec<NamedConstraint> = constraints
                .values()
                .filter_map(|c| {
                    c.comp_het
                        .as_ref()
                        .map(|ch| NamedConstraint::new(comp_het_name(&c.family_id), ch.clone()))
                })
                .collect();
            let any_alt = mode.is_none()
                && spec.inheritance.filter.genotype.is_empty()
                && quality::thresholds(&spec.quality_filter, source.dataset_type)?.is_empty();
            let plain_filter = if any_alt {
                Some(FamilyFilter::AnyAlt {
                    sample_families: samples
                        .iter()
                        .filter_map(|sample| {
                            family_index
                                .sample(&sample.sample_id)
                                .map(|m| (sample.sample_id.clone(), m.family_id.clone()))
                        })
                        .collect(),
                })
            } else if plain_named.is_empty() {
                None
            } else {
                Some(FamilyFilter::Named(plain_named))
            };
            let comp_het_filter = if comp_het_named.is_empty() {
                None
            } else {
                Some(FamilyFilter::Named(comp_het_named))
            };

            for constraint in constraints.values().filter(|c| c.comp_het.is_some()) {
                pairing_families
                    .entry(constraint.family_id.clone())
                    .or_insert_with(|| PairingFamily::from(constraint));
            }
            sources.insert(
                source_id.to_string(),
                SourcePlan {
                    adapter,
                    source,
                    predicate,
                    comp_het_predicate,
                    plain_filter,
                    comp_het_filter,
                    sample_ids: samples.iter().map(|s| s.sample_id.clone()).collect(),
                },
            );
        }

        if sources.is_empty() {
            return Err(SearchError::SearchDisabled {
                reason: String::from(
                    "no family with affected individuals is eligible for the inheritance filter",
                ),
            });
        }

        let (pathogenic_clinvar, pathogenic_hgmd) =
            consequences::pathogenicity_values(&spec.pathogenicity)?;
        let plain_count = sources
            .values()
            .filter(|plan: &&SourcePlan| plan.plain_filter.is_some())
            .count();
        let cursor_mode = if is_comp_het {
            CursorMode::CompoundHet
        } else if plain_count == 1 {
            CursorMode::Single
        } else {
            CursorMode::MultiSource
        };
        tracing::debug!(
            "prepared search over {} data source(s) in mode {:?}",
            sources.len(),
            cursor_mode
        );

        Ok(PreparedSearch {
            key: cursor::cache_key(request)?,
            sources,
            sort: request.sort.fields(),
            family_order: request
                .families
                .iter()
                .map(|family| family.family_id.clone())
                .collect(),
            family_index,
            search_build: spec.genome_version(),
            mode: cursor_mode,
            pairing_families,
            pairing: PairingSettings {
                consequences: consequence_terms,
                secondary_consequences: secondary_terms,
                pathogenic_clinvar,
                pathogenic_hgmd,
                max_variants_per_gene: self.config.max_variants_per_gene,
                max_genes: self.config.max_compound_het_genes,
            },
            comp_het_gene_ids: comp_het_gene_ids(&spec.locus),
        })
    }

    /// Load until results `[start, end)` are placed or all results are known.
    ///
    /// Returns the new state and whether it changed.
    async fn advance(
        &self,
        prepared: &PreparedSearch,
        mut state: CursorState,
        start: usize,
        end: usize,
        load_all: bool,
    ) -> Result<(CursorState, bool), SearchError> {
        let mut changed = false;
        loop {
            let load = match cursor::plan(&state, start, end, prepared.mode) {
                Plan::Cached { start, end } => {
                    tracing::debug!("serving results {}..{} from cursor", start, end);
                    return Ok((state, changed));
                }
                Plan::Load(load) => load,
            };
            let loaded = self.load(prepared, &load).await?;
            let loaded_rows: usize = loaded.sources.values().map(|(rows, _)| rows.len()).sum();
            let progressed = loaded_rows > 0 || loaded.comp_het.is_some();
            enter(Phase::Deduplicating);
            state = cursor::apply(state, loaded, load.end, prepared.search_build);
            changed = true;

            if load_all {
                if let Some(total) = state.total_results {
                    if total > self.config.max_result_window {
                        return Err(SearchError::TooManyResults {
                            requested: total,
                            max_window: self.config.max_result_window,
                        });
                    }
                }
            }
            if !progressed {
                tracing::warn!("data sources returned no further rows, stopping");
                return Ok((state, changed));
            }
        }
    }

    /// Run one fan-out round and normalize its rows.
    async fn load(
        &self,
        prepared: &PreparedSearch,
        load: &LoadPlan,
    ) -> Result<LoadedRows, SearchError> {
        let mut jobs = Vec::new();
        for (source_id, window) in &load.windows {
            let Some(plan) = prepared.sources.get(source_id) else {
                continue;
            };
            let Some(filter) = &plan.plain_filter else {
                continue;
            };
            let remaining = self.config.max_result_window.saturating_sub(window.offset);
            if remaining == 0 {
                return Err(SearchError::TooManyResults {
                    requested: window.offset + window.limit,
                    max_window: self.config.max_result_window,
                });
            }
            jobs.push(Job {
                kind: JobKind::Plain,
                adapter: plan.adapter.clone(),
                request: self.request(
                    prepared,
                    plan,
                    filter,
                    QueryMode::Plain,
                    window.offset,
                    window.limit.min(remaining),
                ),
                named_constraints: filter.is_named(),
            });
        }
        if load.load_comp_het {
            for plan in prepared.sources.values() {
                let Some(filter) = &plan.comp_het_filter else {
                    continue;
                };
                let mode = QueryMode::GeneAggregation {
                    max_per_gene: self.config.max_variants_per_gene,
                    max_genes: self.config.max_compound_het_genes,
                    gene_ids: prepared.comp_het_gene_ids.clone(),
                };
                jobs.push(Job {
                    kind: JobKind::GeneAggregation,
                    adapter: plan.adapter.clone(),
                    request: self.request(prepared, plan, filter, mode, 0, 0),
                    named_constraints: true,
                });
            }
        }

        enter(Phase::Executing);
        tracing::debug!(
            "executing {} sub-queries ({})",
            jobs.len(),
            if load.is_single_query { "single" } else { "fan-out" }
        );
        let timeout = Duration::from_secs(self.config.query_timeout_secs);
        let round = join_all(jobs.iter().map(|job| job.adapter.execute(&job.request)));
        let responses = match tokio::time::timeout(timeout, round).await {
            Ok(responses) => responses,
            Err(_) => {
                let cancelled = self.cancel_long_running().await;
                return Err(SearchError::Timeout {
                    source_ids: jobs.iter().map(|job| job.request.source_id.clone()).collect(),
                    timeout_secs: self.config.query_timeout_secs,
                    cancelled,
                });
            }
        };
        // All sub-queries must succeed before anything is merged.
        let responses = responses.into_iter().collect::<Result<Vec<_>, _>>()?;

        enter(Phase::Normalizing);
        let mut result = LoadedRows::default();
        let mut buckets: IndexMap<String, Vec<VariantRecord>> = IndexMap::new();
        for (job, response) in jobs.iter().zip(responses) {
            match job.kind {
                JobKind::Plain => {
                    let total = response.total;
                    let source_id = response.source.source_id.clone();
                    let records = self.normalize_hits(prepared, job, response)?;
                    result.sources.insert(source_id, (records, total));
                }
                JobKind::GeneAggregation => {
                    let ctx = NormalizeContext {
                        source: &response.source,
                        families: &prepared.family_index,
                        mapper: self.mapper.as_ref(),
                        sort: &prepared.sort,
                        search_build: prepared.search_build,
                        named_constraints: job.named_constraints,
                    };
                    for bucket in response.gene_buckets.clone() {
                        let records = bucket
                            .hits
                            .into_iter()
                            .map(|hit| normalize(hit, &ctx))
                            .collect::<Result<Vec<_>, _>>()?;
                        buckets.entry(bucket.gene_id).or_default().extend(records);
                    }
                }
            }
        }

        if load.load_comp_het {
            enter(Phase::Deduplicating);
            let mut counters = DedupCounters::default();
            let buckets: Vec<(String, Vec<VariantRecord>)> = buckets
                .into_iter()
                .map(|(gene_id, mut records)| {
                    records.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
                    let records = deduplicate(records, prepared.search_build, &mut counters);
                    (gene_id, records)
                })
                .collect();
            enter(Phase::CompoundHetPairing);
            let pairs = pair_compound_hets(buckets, &prepared.pairing_families, &prepared.pairing)?;
            tracing::debug!("built {} compound heterozygous pairs", pairs.len());
            result.comp_het = Some(pairs);
        }
        Ok(result)
    }

    fn normalize_hits(
        &self,
        prepared: &PreparedSearch,
        job: &Job,
        response: QueryResponse,
    ) -> Result<Vec<VariantRecord>, SearchError> {
        let ctx = NormalizeContext {
            source: &response.source,
            families: &prepared.family_index,
            mapper: self.mapper.as_ref(),
            sort: &prepared.sort,
            search_build: prepared.search_build,
            named_constraints: job.named_constraints,
        };
        response
            .hits
            .iter()
            .cloned()
            .map(|hit| normalize(hit, &ctx))
            .collect()
    }

    fn request(
        &self,
        prepared: &PreparedSearch,
        plan: &SourcePlan,
        filter: &FamilyFilter,
        mode: QueryMode,
        offset: usize,
        limit: usize,
    ) -> QueryRequest {
        let predicate = match mode {
            QueryMode::Plain => plan.predicate.clone(),
            QueryMode::GeneAggregation { .. } => plan.comp_het_predicate.clone(),
        };
        QueryRequest {
            source_id: plan.source.source_id.clone(),
            predicate,
            family_filter: filter.clone(),
            mode,
            offset,
            limit,
            sort: prepared.sort.clone(),
            family_order: prepared.family_order.clone(),
            sample_ids: plan.sample_ids.clone(),
        }
    }

    /// Cancel the server-side tasks above the long-running threshold on all backends.
    async fn cancel_long_running(&self) -> usize {
        let threshold = Duration::from_secs(self.config.long_running_threshold_secs);
        let mut cancelled = 0;
        for adapter in self.registry.adapters() {
            let tasks = adapter.list_running(threshold).await;
            if tasks.is_empty() {
                continue;
            }
            for task in &tasks {
                tracing::warn!(
                    "cancelling task {} on {} running for {:?}",
                    task.id,
                    &task.source_id,
                    task.age
                );
            }
            let ids: Vec<uuid::Uuid> = tasks.iter().map(|task| task.id).collect();
            cancelled += adapter.cancel(&ids).await;
        }
        cancelled
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::search::{
        backend::{
            columnar::{ColumnarAdapter, ColumnarSettings, TableSource},
            index::{IndexAdapter, IndexSettings, IndexSource},
            testing::SlowAdapter,
        },
        cursor::InMemoryCache,
        liftover::{ChainBlock, ChainMapper},
        lookup::{GeneCoordinates, GeneInfo, InMemoryGenes},
        schema::{AffectedStatus, Individual, InheritanceMode, Sex},
    };

    fn call(sample_id: &str, num_alt: i8) -> serde_json::Value {
        json!({"sampleId": sample_id, "numAlt": num_alt, "gq": 40})
    }

    fn doc(chrom: &str, pos: i32, gene: &str, calls: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "variantId": format!("{}-{}-A-G", chrom, pos),
            "contig": chrom,
            "start": pos,
            "ref": "A",
            "alt": "G",
            "xpos": crate::common::xpos(chrom, pos),
            "sortedTranscriptConsequences": [
                {"transcriptId": format!("T{}", pos), "geneId": gene, "majorConsequence": "missense_variant"}
            ],
            "mainTranscriptId": format!("T{}", pos),
            "genotypes": calls,
        })
    }

    fn index(
        name: &str,
        genome_version: GenomeRelease,
        sample_ids: &[&str],
        documents: Vec<serde_json::Value>,
    ) -> IndexSource {
        IndexSource {
            name: name.to_string(),
            genome_version,
            dataset_type: DatasetType::SnvIndel,
            schema_version: 2,
            sample_ids: sample_ids.iter().map(|s| s.to_string()).collect(),
            documents,
        }
    }

    /// Trio with affected child I1, unaffected parents I2 and I3.
    fn trio(family_id: &str, prefix: &str) -> Family {
        Family::new(
            family_id.to_string(),
            vec![
                Individual::new(format!("{}1", prefix), Sex::Female, AffectedStatus::Affected),
                Individual::new(format!("{}2", prefix), Sex::Male, AffectedStatus::Unaffected),
                Individual::new(format!("{}3", prefix), Sex::Female, AffectedStatus::Unaffected),
            ],
        )
    }

    fn samples(prefix: &str, source: &str, genome_version: GenomeRelease) -> Vec<Sample> {
        (1..=3)
            .map(|i| {
                Sample::new(
                    format!("S{}{}", prefix, i),
                    format!("{}{}", prefix, i),
                    source.to_string(),
                    DatasetType::SnvIndel,
                    genome_version,
                )
            })
            .collect()
    }

    fn engine_with(
        sources: Vec<IndexSource>,
        mapper: ChainMapper,
        config: EngineConfig,
        latency: Option<Duration>,
    ) -> SearchEngine {
        let adapter: Arc<dyn BackendQueryAdapter> = Arc::new(
            IndexAdapter::new(sources, IndexSettings::new(config.max_result_window))
                .expect("valid sources"),
        );
        let adapter: Arc<dyn BackendQueryAdapter> = match latency {
            Some(latency) => Arc::new(SlowAdapter::new(adapter, latency)),
            None => adapter,
        };
        let mut registry = AdapterRegistry::default();
        registry.register(DatasetType::SnvIndel, adapter);
        let genes = InMemoryGenes::new(vec![GeneInfo {
            gene_id: String::from("G1"),
            symbol: Some(String::from("GENE1")),
            coordinates: enum_map::enum_map! {
                GenomeRelease::Grch37 => Some(GeneCoordinates::new(String::from("1"), 1, 5_000)),
                GenomeRelease::Grch38 => Some(GeneCoordinates::new(String::from("1"), 1, 5_000)),
            },
        }]);
        SearchEngine::new(
            registry,
            Arc::new(genes),
            Arc::new(mapper),
            Arc::new(InMemoryCache::default()),
            config,
        )
    }

    fn engine(sources: Vec<IndexSource>) -> SearchEngine {
        engine_with(sources, ChainMapper::default(), EngineConfig::default(), None)
    }

    fn request(mode: Option<InheritanceMode>, families: Vec<Family>, samples: Vec<Sample>) -> SearchRequest {
        let mut request = SearchRequest {
            families,
            samples,
            ..Default::default()
        };
        request.search.inheritance.mode = mode;
        request
    }

    fn positions(page: &SearchPage) -> Vec<Vec<i32>> {
        page.results
            .iter()
            .map(|item| item.variants().iter().map(|v| v.pos).collect())
            .collect()
    }

    #[tokio::test]
    async fn de_novo_excludes_carrier_parent() -> Result<(), anyhow::Error> {
        let engine = engine(vec![index(
            "idx",
            GenomeRelease::Grch38,
            &["SI1", "SI2", "SI3"],
            vec![
                doc("1", 100, "G1", vec![call("SI1", 1), call("SI2", 0), call("SI3", 0)]),
                doc("1", 200, "G1", vec![call("SI1", 1), call("SI2", 1), call("SI3", 0)]),
            ],
        )]);
        let request = request(
            Some(InheritanceMode::DeNovo),
            vec![trio("F1", "I")],
            samples("I", "idx", GenomeRelease::Grch38),
        );
        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(positions(&page), vec![vec![100]]);
        assert_eq!(page.total_results, 1);
        assert_eq!(page.results[0].variants()[0].family_ids, vec![String::from("F1")]);
        Ok(())
    }

    /// Father carries the first, mother the second variant.
    fn comp_het_docs() -> Vec<serde_json::Value> {
        vec![
            doc("1", 100, "G1", vec![call("SI1", 1), call("SI2", 1), call("SI3", 0)]),
            doc("1", 200, "G1", vec![call("SI1", 1), call("SI2", 0), call("SI3", 1)]),
        ]
    }

    #[tokio::test]
    async fn compound_het_pair_is_returned() -> Result<(), anyhow::Error> {
        let engine = engine(vec![index(
            "idx",
            GenomeRelease::Grch38,
            &["SI1", "SI2", "SI3"],
            comp_het_docs(),
        )]);
        let request = request(
            Some(InheritanceMode::CompoundHet),
            vec![trio("F1", "I")],
            samples("I", "idx", GenomeRelease::Grch38),
        );
        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(positions(&page), vec![vec![100, 200]]);
        assert_eq!(page.total_results, 1);
        for variant in page.results[0].variants() {
            assert_eq!(variant.comp_het_gene_id.as_deref(), Some("G1"));
            assert_eq!(variant.family_ids, vec![String::from("F1")]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn compound_het_double_het_parent_is_rejected() -> Result<(), anyhow::Error> {
        let mut docs = comp_het_docs();
        // father is het for both variants
        docs[1] = doc("1", 200, "G1", vec![call("SI1", 1), call("SI2", 1), call("SI3", 0)]);
        let engine = engine(vec![index(
            "idx",
            GenomeRelease::Grch38,
            &["SI1", "SI2", "SI3"],
            docs,
        )]);
        let request = request(
            Some(InheritanceMode::CompoundHet),
            vec![trio("F1", "I")],
            samples("I", "idx", GenomeRelease::Grch38),
        );
        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(page, SearchPage::default());
        Ok(())
    }

    #[tokio::test]
    async fn cross_build_duplicates_are_merged() -> Result<(), anyhow::Error> {
        let mut mapper = ChainMapper::default();
        mapper.add_block(
            GenomeRelease::Grch38,
            "1",
            ChainBlock::new(1_001, String::from("1"), 1, 1_000),
        );
        let engine = engine_with(
            vec![
                index(
                    "idx38",
                    GenomeRelease::Grch38,
                    &["SI1", "SI2", "SI3"],
                    vec![
                        doc("1", 2_000, "G1", vec![call("SI1", 1), call("SI2", 0), call("SI3", 0)]),
                        doc("1", 3_000, "G1", vec![call("SI1", 1), call("SI2", 0), call("SI3", 0)]),
                    ],
                ),
                index(
                    "idx37",
                    GenomeRelease::Grch37,
                    &["SJ1", "SJ2", "SJ3"],
                    vec![doc("1", 1_000, "G1", vec![call("SJ1", 1), call("SJ2", 0), call("SJ3", 0)])],
                ),
            ],
            mapper,
            EngineConfig::default(),
            None,
        );
        let mut all_samples = samples("I", "idx38", GenomeRelease::Grch38);
        all_samples.extend(samples("J", "idx37", GenomeRelease::Grch37));
        let request = request(
            Some(InheritanceMode::DeNovo),
            vec![trio("F1", "I"), trio("F2", "J")],
            all_samples,
        );
        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(positions(&page), vec![vec![2_000], vec![3_000]]);
        assert_eq!(page.total_results, 2);
        let merged = page.results[0].variants()[0];
        assert_eq!(merged.genome_version, GenomeRelease::Grch38);
        assert_eq!(merged.family_ids, vec![String::from("F1"), String::from("F2")]);
        assert_eq!(merged.genotypes.len(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn merged_duplicate_keeps_sort_position() -> Result<(), anyhow::Error> {
        let mut mapper = ChainMapper::default();
        mapper.add_block(
            GenomeRelease::Grch37,
            "1",
            ChainBlock::new(1, String::from("1"), 1_001, 10_000),
        );
        let de_novo = |prefix: &str| {
            vec![
                call(&format!("S{}1", prefix), 1),
                call(&format!("S{}2", prefix), 0),
                call(&format!("S{}3", prefix), 0),
            ]
        };
        let engine = engine_with(
            vec![
                index(
                    "idx38",
                    GenomeRelease::Grch38,
                    &["SI1", "SI2", "SI3"],
                    vec![
                        doc("1", 1_500, "G1", de_novo("I")),
                        doc("1", 2_000, "G1", de_novo("I")),
                        doc("1", 3_000, "G1", de_novo("I")),
                    ],
                ),
                index(
                    "idx37",
                    GenomeRelease::Grch37,
                    &["SJ1", "SJ2", "SJ3"],
                    vec![doc("1", 1_000, "G1", de_novo("J"))],
                ),
            ],
            mapper,
            EngineConfig::default(),
            None,
        );
        let mut all_samples = samples("I", "idx38", GenomeRelease::Grch38);
        all_samples.extend(samples("J", "idx37", GenomeRelease::Grch37));
        let request = request(
            Some(InheritanceMode::DeNovo),
            vec![trio("F1", "I"), trio("F2", "J")],
            all_samples,
        );
        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(positions(&page), vec![vec![1_500], vec![2_000], vec![3_000]]);
        assert_eq!(page.total_results, 3);
        let merged = page.results[1].variants()[0];
        assert_eq!(merged.genome_version, GenomeRelease::Grch38);
        assert_eq!(merged.family_ids, vec![String::from("F1"), String::from("F2")]);
        Ok(())
    }

    fn with_consequence(mut doc: serde_json::Value, term: &str) -> serde_json::Value {
        doc["sortedTranscriptConsequences"][0]["majorConsequence"] = json!(term);
        doc
    }

    #[tokio::test]
    async fn secondary_consequences_only_relax_pairs() -> Result<(), anyhow::Error> {
        let mut docs = comp_het_docs();
        docs[1] = with_consequence(docs[1].clone(), "intron_variant");
        docs.push(with_consequence(
            doc("1", 150, "G1", vec![call("SI1", 2), call("SI2", 1), call("SI3", 1)]),
            "intron_variant",
        ));
        let engine = engine(vec![index(
            "idx",
            GenomeRelease::Grch38,
            &["SI1", "SI2", "SI3"],
            docs,
        )]);
        let mut request = request(
            Some(InheritanceMode::Recessive),
            vec![trio("F1", "I")],
            samples("I", "idx", GenomeRelease::Grch38),
        );
        request.search.annotations = [(
            String::from("missense"),
            vec![String::from("missense_variant")],
        )]
        .into_iter()
        .collect();
        request.search.annotations_secondary = Some(
            [(String::from("intron"), vec![String::from("intron_variant")])]
                .into_iter()
                .collect(),
        );

        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(positions(&page), vec![vec![100, 200]]);
        assert_eq!(page.total_results, 1);
        Ok(())
    }

    #[tokio::test]
    async fn later_page_loads_contiguously() -> Result<(), anyhow::Error> {
        let documents = (1..=10)
            .map(|i| doc("1", i * 100, "G1", vec![call("SI1", 1)]))
            .collect();
        let engine = engine(vec![index("idx", GenomeRelease::Grch38, &["SI1"], documents)]);
        let request = request(
            None,
            vec![Family::new(
                String::from("F1"),
                vec![Individual::new(String::from("I1"), Sex::Female, AffectedStatus::Affected)],
            )],
            vec![Sample::new(
                String::from("SI1"),
                String::from("I1"),
                String::from("idx"),
                DatasetType::SnvIndel,
                GenomeRelease::Grch38,
            )],
        );
        let first = engine.search(&request, 1, 2, false).await?;
        assert_eq!(positions(&first), vec![vec![100], vec![200]]);
        let third = engine.search(&request, 3, 2, false).await?;
        assert_eq!(positions(&third), vec![vec![500], vec![600]]);
        assert_eq!(third.total_results, 10);

        let key = cursor::cache_key(&request)?;
        let (state, version) = engine.cache.get(&key).await?.expect("cursor stored");
        assert_eq!(state.all_results.len(), 6);
        assert_eq!(state.sources["idx"].loaded, 6);

        // served from the cursor without writing it
        let second = engine.search(&request, 2, 2, false).await?;
        assert_eq!(positions(&second), vec![vec![300], vec![400]]);
        assert_eq!(engine.search(&request, 2, 2, false).await?, second);
        let (_, unchanged) = engine.cache.get(&key).await?.expect("cursor stored");
        assert_eq!(unchanged, version);
        Ok(())
    }

    #[tokio::test]
    async fn recessive_merges_pairs_and_homozygous() -> Result<(), anyhow::Error> {
        let mut docs = comp_het_docs();
        docs.push(doc("1", 150, "G1", vec![call("SI1", 2), call("SI2", 1), call("SI3", 1)]));
        let engine = engine(vec![index(
            "idx",
            GenomeRelease::Grch38,
            &["SI1", "SI2", "SI3"],
            docs,
        )]);
        let request = request(
            Some(InheritanceMode::Recessive),
            vec![trio("F1", "I")],
            samples("I", "idx", GenomeRelease::Grch38),
        );
        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(positions(&page), vec![vec![100, 200], vec![150]]);
        assert_eq!(page.total_results, 2);
        Ok(())
    }

    #[tokio::test]
    async fn gene_counts_per_family() -> Result<(), anyhow::Error> {
        let engine = engine(vec![index(
            "idx",
            GenomeRelease::Grch38,
            &["SI1", "SI2", "SI3"],
            comp_het_docs(),
        )]);
        let request = request(
            Some(InheritanceMode::CompoundHet),
            vec![trio("F1", "I")],
            samples("I", "idx", GenomeRelease::Grch38),
        );
        let counts = engine.gene_counts(&request).await?;
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["G1"].total, 2);
        assert_eq!(counts["G1"].families["F1"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn search_disabled_without_affected() {
        let engine = engine(vec![index("idx", GenomeRelease::Grch38, &["SI2"], vec![])]);
        let family = Family::new(
            String::from("F1"),
            vec![
                Individual::new(String::from("I1"), Sex::Female, AffectedStatus::Affected),
                Individual::new(String::from("I2"), Sex::Male, AffectedStatus::Unaffected),
            ],
        );
        let request = request(
            Some(InheritanceMode::DeNovo),
            vec![family],
            vec![Sample::new(
                String::from("SI2"),
                String::from("I2"),
                String::from("idx"),
                DatasetType::SnvIndel,
                GenomeRelease::Grch38,
            )],
        );
        let err = engine.search(&request, 1, 10, false).await.unwrap_err();
        assert!(matches!(err, SearchError::SearchDisabled { .. }));
    }

    #[tokio::test]
    async fn missing_data_source() {
        let engine = engine(vec![]);
        let request = request(
            Some(InheritanceMode::DeNovo),
            vec![trio("F1", "I")],
            samples("I", "nope", GenomeRelease::Grch38),
        );
        assert_eq!(
            engine.search(&request, 1, 10, false).await,
            Err(SearchError::MissingDataSource {
                source_id: String::from("nope"),
                family_id: String::from("F1"),
            })
        );
    }

    #[tokio::test]
    async fn mixed_builds_in_family() {
        let engine = engine(vec![]);
        let mut samples = samples("I", "idx", GenomeRelease::Grch38);
        samples[2].genome_version = GenomeRelease::Grch37;
        let request = request(Some(InheritanceMode::DeNovo), vec![trio("F1", "I")], samples);
        let err = engine.search(&request, 1, 10, false).await.unwrap_err();
        assert!(matches!(err, SearchError::MixedGenomeBuilds { .. }));
    }

    #[tokio::test]
    async fn too_many_families_without_location() {
        let config = EngineConfig {
            max_comp_het_families_no_location: 1,
            ..Default::default()
        };
        let engine = engine_with(vec![], ChainMapper::default(), config, None);
        let mut all_samples = samples("I", "idx", GenomeRelease::Grch38);
        all_samples.extend(samples("J", "idx", GenomeRelease::Grch38));
        let mut request = request(
            Some(InheritanceMode::CompoundHet),
            vec![trio("F1", "I"), trio("F2", "J")],
            all_samples,
        );
        assert_eq!(
            engine.search(&request, 1, 10, false).await,
            Err(SearchError::TooManyFamilies {
                count: 2,
                max_families: 1
            })
        );
        // a location lifts the limit, the data source is the next problem
        request.search.locus.genes.push(String::from("G1"));
        assert!(matches!(
            engine.search(&request, 1, 10, false).await,
            Err(SearchError::MissingDataSource { .. })
        ));
    }

    #[tokio::test]
    async fn load_all_respects_window() -> Result<(), anyhow::Error> {
        let documents = (1..=5)
            .map(|i| doc("1", i * 100, "G1", vec![call("SI1", 1)]))
            .collect();
        let config = EngineConfig {
            max_result_window: 3,
            ..Default::default()
        };
        let engine = engine_with(
            vec![index("idx", GenomeRelease::Grch38, &["SI1"], documents)],
            ChainMapper::default(),
            config,
            None,
        );
        let request = request(
            None,
            vec![Family::new(
                String::from("F1"),
                vec![Individual::new(String::from("I1"), Sex::Female, AffectedStatus::Affected)],
            )],
            vec![Sample::new(
                String::from("SI1"),
                String::from("I1"),
                String::from("idx"),
                DatasetType::SnvIndel,
                GenomeRelease::Grch38,
            )],
        );
        assert_eq!(
            engine.search(&request, 1, 100, true).await,
            Err(SearchError::TooManyResults {
                requested: 5,
                max_window: 3
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn timeout_cancels_running_tasks() {
        let config = EngineConfig {
            query_timeout_secs: 1,
            long_running_threshold_secs: 0,
            ..Default::default()
        };
        let engine = engine_with(
            vec![index("idx", GenomeRelease::Grch38, &["SI1", "SI2", "SI3"], comp_het_docs())],
            ChainMapper::default(),
            config,
            Some(Duration::from_secs(30)),
        );
        let request = request(
            Some(InheritanceMode::DeNovo),
            vec![trio("F1", "I")],
            samples("I", "idx", GenomeRelease::Grch38),
        );
        let err = engine.search(&request, 1, 10, false).await.unwrap_err();
        assert_eq!(
            err,
            SearchError::Timeout {
                source_ids: vec![String::from("idx")],
                timeout_secs: 1,
                cancelled: 1,
            }
        );
        let key = cursor::cache_key(&request).expect("valid request");
        assert_eq!(engine.cache.get(&key).await, Ok(None));
    }

    #[tokio::test]
    async fn columnar_and_index_sources_together() -> Result<(), anyhow::Error> {
        let table: TableSource = serde_json::from_value(json!({
            "name": "sv",
            "genome_version": "38",
            "dataset_type": "SV",
            "sample_ids": ["SVI1"],
            "rows": [{
                "variant_id": "1-150-DEL",
                "chrom": "1",
                "pos": 150,
                "end": 250,
                "xpos": 1_000_000_150i64,
                "sv_type": "DEL",
                "calls": [{"sample_id": "SVI1", "num_alt": 1, "qs": 50}]
            }]
        }))?;
        let mut engine = engine(vec![index(
            "idx",
            GenomeRelease::Grch38,
            &["SI1"],
            vec![doc("1", 100, "G1", vec![call("SI1", 1)])],
        )]);
        engine.registry.register(
            DatasetType::Sv,
            Arc::new(ColumnarAdapter::new(vec![table], ColumnarSettings::new(10_000))),
        );
        let request = request(
            None,
            vec![Family::new(
                String::from("F1"),
                vec![Individual::new(String::from("I1"), Sex::Female, AffectedStatus::Affected)],
            )],
            vec![
                Sample::new(
                    String::from("SI1"),
                    String::from("I1"),
                    String::from("idx"),
                    DatasetType::SnvIndel,
                    GenomeRelease::Grch38,
                ),
                Sample::new(
                    String::from("SVI1"),
                    String::from("I1"),
                    String::from("sv"),
                    DatasetType::Sv,
                    GenomeRelease::Grch38,
                ),
            ],
        );
        let page = engine.search(&request, 1, 10, false).await?;
        assert_eq!(positions(&page), vec![vec![100], vec![150]]);
        assert_eq!(page.total_results, 2);
        assert_eq!(page.results[1].variants()[0].dataset_type, DatasetType::Sv);
        Ok(())
    }
}
