//! Variant search over inverted-index and columnar data sources.
//!
//! The `search query` sub command runs one page request of a search against in-memory
//! backends loaded from a store manifest.

pub mod backend;
pub mod comp_het;
pub mod cursor;
pub mod dedup;
pub mod interpreter;
pub mod liftover;
pub mod lookup;
pub mod normalize;
pub mod orchestrator;
pub mod schema;
pub mod sorting;

use std::{io::Write, path::PathBuf, sync::Arc, time::Instant};

use clap::Parser;
use enum_map::EnumMap;
use serde::{Deserialize, Serialize};
use thousands::Separable;

use crate::{
    common::trace_rss_now,
    search::{
        backend::{
            columnar::{ColumnarAdapter, ColumnarSettings, TableSource},
            index::{IndexAdapter, IndexSettings, IndexSource},
            AdapterRegistry, BackendQueryAdapter,
        },
        cursor::InMemoryCache,
        liftover::{CachedMapper, ChainMapper},
        lookup::InMemoryGenes,
        orchestrator::{EngineConfig, SearchEngine},
        schema::{DatasetType, SearchRequest},
    },
};

/// Command line arguments for `search query` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run one page of a variant search", long_about = None)]
pub struct Args {
    /// Path to the search request JSON file.
    #[arg(long, required = true)]
    pub path_request: PathBuf,
    /// Path to the store manifest JSON file with the data sources.
    #[arg(long, required = true)]
    pub path_store: PathBuf,
    /// Path to the gene JSON file.
    #[arg(long, required = true)]
    pub path_genes: PathBuf,
    /// Optional path to the liftover chain block TSV file.
    #[arg(long)]
    pub path_liftover: Option<PathBuf>,
    /// Optional path to the engine configuration TOML file.
    #[arg(long)]
    pub path_conf: Option<PathBuf>,
    /// Optional path to the JSON file the pagination cache is persisted in.
    #[arg(long)]
    pub path_cache: Option<PathBuf>,
    /// The 1-based page to return.
    #[arg(long, default_value_t = 1)]
    pub page: usize,
    /// Number of results per page.
    #[arg(long, default_value_t = 100)]
    pub page_size: usize,
    /// Return all results instead of one page.
    #[arg(long, default_value_t = false)]
    pub load_all: bool,
    /// Write the per-gene variant counts instead of a page.
    #[arg(long, default_value_t = false)]
    pub gene_counts: bool,
    /// Path to the output JSON file.
    #[arg(long, required = true)]
    pub path_output: PathBuf,
}

/// The data sources of a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Inverted indices.
    #[serde(default)]
    pub indices: Vec<IndexSource>,
    /// Columnar tables.
    #[serde(default)]
    pub tables: Vec<TableSource>,
}

impl StoreManifest {
    /// Load from a JSON file.
    #[tracing::instrument]
    pub fn from_path(path: &std::path::Path) -> Result<Self, anyhow::Error> {
        let before_loading = Instant::now();
        let result: Self =
            serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(path)?))?;
        tracing::debug!(
            "... done loading {} indices with {} documents and {} tables with {} rows in {:?}",
            result.indices.len(),
            result
                .indices
                .iter()
                .map(|i| i.documents.len())
                .sum::<usize>()
                .separate_with_commas(),
            result.tables.len(),
            result
                .tables
                .iter()
                .map(|t| t.rows.len())
                .sum::<usize>()
                .separate_with_commas(),
            before_loading.elapsed()
        );
        Ok(result)
    }

    /// Build the adapter registry.
    ///
    /// Each dataset type is served by one backend, indices and tables must not share one.
    pub fn into_registry(self, config: &EngineConfig) -> Result<AdapterRegistry, anyhow::Error> {
        let mut owners: EnumMap<DatasetType, Option<&'static str>> = EnumMap::default();
        let mut claim = |dataset_type: DatasetType, backend: &'static str| {
            match owners[dataset_type] {
                Some(owner) if owner != backend => Err(anyhow::anyhow!(
                    "dataset type {} is served by both {} and {}",
                    dataset_type,
                    owner,
                    backend
                )),
                _ => {
                    owners[dataset_type] = Some(backend);
                    Ok(())
                }
            }
        };
        for index in &self.indices {
            claim(index.dataset_type, "inverted-index")?;
        }
        for table in &self.tables {
            claim(table.dataset_type, "columnar")?;
        }

        let mut registry = AdapterRegistry::default();
        if !self.indices.is_empty() {
            let adapter: Arc<dyn BackendQueryAdapter> = Arc::new(IndexAdapter::new(
                self.indices,
                IndexSettings::new(config.max_result_window),
            )?);
            for (dataset_type, owner) in owners.iter() {
                if *owner == Some("inverted-index") {
                    registry.register(dataset_type, adapter.clone());
                }
            }
        }
        if !self.tables.is_empty() {
            let adapter: Arc<dyn BackendQueryAdapter> = Arc::new(ColumnarAdapter::new(
                self.tables,
                ColumnarSettings::new(config.max_result_window),
            ));
            for (dataset_type, owner) in owners.iter() {
                if *owner == Some("columnar") {
                    registry.register(dataset_type, adapter.clone());
                }
            }
        }
        Ok(registry)
    }
}

/// Load the engine configuration, defaults if no file is given.
pub fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig, anyhow::Error> {
    match path {
        Some(path) => {
            let toml_str = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&toml_str)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Main entry point for `search query` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    tracing::info!("Loading configuration and inputs...");
    let config = load_config(args.path_conf.as_deref())?;
    let request: SearchRequest =
        serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(&args.path_request)?))?;
    let genes = InMemoryGenes::from_path(&args.path_genes)?;
    let mapper = match &args.path_liftover {
        Some(path) => ChainMapper::from_path(path)?,
        None => ChainMapper::default(),
    };
    let registry = StoreManifest::from_path(&args.path_store)?.into_registry(&config)?;
    let cache = match &args.path_cache {
        Some(path) => InMemoryCache::load(path)?,
        None => InMemoryCache::default(),
    };
    let cache = Arc::new(cache);
    trace_rss_now();

    let engine = SearchEngine::new(
        registry,
        Arc::new(genes),
        Arc::new(CachedMapper::new(mapper)),
        cache.clone(),
        config,
    );

    tracing::info!("Running search...");
    let before_search = Instant::now();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(async {
        if args.gene_counts {
            Ok::<_, anyhow::Error>(serde_json::to_value(engine.gene_counts(&request).await?)?)
        } else {
            let page = engine
                .search(&request, args.page, args.page_size, args.load_all)
                .await?;
            Ok(serde_json::to_value(page)?)
        }
    })?;
    tracing::info!("... done running search in {:?}", before_search.elapsed());

    let mut writer = std::io::BufWriter::new(std::fs::File::create(&args.path_output)?);
    serde_json::to_writer_pretty(&mut writer, &output)?;
    writer.flush()?;
    if let Some(path) = &args.path_cache {
        cache.save(path)?;
        tracing::debug!("saved {} cursor(s) to {:?}", cache.len(), path);
    }

    tracing::info!("All of `search query` completed in {:?}", before_anything.elapsed());
    Ok(())
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use clap_verbosity_flag::Verbosity;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common;

    fn args(tmp_dir: &Path, page: usize, gene_counts: bool) -> Args {
        Args {
            path_request: PathBuf::from("tests/data/search/request.json"),
            path_store: PathBuf::from("tests/data/search/store.json"),
            path_genes: PathBuf::from("tests/data/search/genes.json"),
            path_liftover: Some(PathBuf::from("tests/data/search/liftover.tsv")),
            path_conf: Some(PathBuf::from("tests/data/search/conf.toml")),
            path_cache: Some(tmp_dir.join("cache.json")),
            page,
            page_size: 1,
            load_all: false,
            gene_counts,
            path_output: tmp_dir.join("out.json"),
        }
    }

    fn read_output(path: &Path) -> Result<serde_json::Value, anyhow::Error> {
        Ok(serde_json::from_reader(std::fs::File::open(path)?)?)
    }

    #[test]
    fn run_pages_resume_from_cache() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let common_args = common::Args {
            verbose: Verbosity::new(0, 0),
        };

        run(&common_args, &args(tmp_dir.path(), 1, false))?;
        let first = read_output(&tmp_dir.path().join("out.json"))?;
        assert_eq!(first["totalResults"], 3);
        assert_eq!(first["results"][0]["pos"], 2_000);
        assert_eq!(
            first["results"][0]["familyIds"],
            serde_json::json!(["F1", "F2"])
        );

        run(&common_args, &args(tmp_dir.path(), 2, false))?;
        let second = read_output(&tmp_dir.path().join("out.json"))?;
        assert_eq!(second["totalResults"], 3);
        assert_eq!(second["results"][0]["pos"], 3_000);

        let cache = InMemoryCache::load(&tmp_dir.path().join("cache.json"))?;
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn run_gene_counts() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        run(&common::Args::default(), &args(tmp_dir.path(), 1, true))?;
        let counts = read_output(&tmp_dir.path().join("out.json"))?;
        assert_eq!(counts["ENSG1"]["total"], 2);
        assert_eq!(counts["ENSG1"]["families"]["F1"], 2);
        assert_eq!(counts["ENSG1"]["families"]["F2"], 1);
        Ok(())
    }

    #[test]
    fn config_from_toml() -> Result<(), anyhow::Error> {
        let config = load_config(Some(Path::new("tests/data/search/conf.toml")))?;
        assert_eq!(config.max_page_size, 50);
        assert_eq!(config.max_result_window, EngineConfig::default().max_result_window);
        Ok(())
    }

    #[test]
    fn conflicting_backends() -> Result<(), anyhow::Error> {
        let manifest: StoreManifest = serde_json::from_value(serde_json::json!({
            "indices": [{
                "name": "a", "genomeVersion": "38", "datasetType": "SV",
                "schemaVersion": 2, "sampleIds": [], "documents": []
            }],
            "tables": [{
                "name": "b", "genome_version": "38", "dataset_type": "SV",
                "sample_ids": [], "rows": []
            }]
        }))?;
        assert!(manifest.into_registry(&EngineConfig::default()).is_err());
        Ok(())
    }
}
