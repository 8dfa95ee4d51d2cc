//! Typed errors surfaced by the search engine.

use std::process::{ExitCode, Termination};

/// Error type of the search engine.
///
/// Every variant carries enough context (offending field, exceeded limit, source id)
/// for rendering a precise message to the user.  None of them are retried by the engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    // -- configuration errors ------------------------------------------------
    #[error("Invalid {field} threshold {value}: must be a multiple of {bin_size}")]
    InvalidQualityThreshold {
        field: String,
        value: i32,
        bin_size: i32,
    },
    #[error("Invalid search configuration for {field}: {message}")]
    InvalidConfiguration { field: String, message: String },
    #[error("Inheritance search requires affected status for family {family_id}")]
    MissingInheritance { family_id: String },
    #[error("Custom affected status given for individual(s) {individual_ids:?} without inheritance mode or genotype filter")]
    CustomAffectedWithoutMode { individual_ids: Vec<String> },

    // -- search too large ----------------------------------------------------
    #[error("Unable to load more than {max_window} variants ({requested} requested)")]
    TooManyResults { requested: usize, max_window: usize },
    #[error("This search returned too many compound heterozygous genes ({count}, at most {max_genes} allowed); please add stricter filters")]
    TooManyGenes { count: usize, max_genes: usize },
    #[error("Location must be specified to search for compound heterozygous variants across more than {max_families} families ({count} given)")]
    TooManyFamilies { count: usize, max_families: usize },

    // -- backend connectivity ------------------------------------------------
    #[error("Backend error on source {source_id}: {message}")]
    Backend { source_id: String, message: String },
    #[error("Query on source(s) {source_ids:?} timed out after {timeout_secs}s; cancelled {cancelled} long running task(s)")]
    Timeout {
        source_ids: Vec<String>,
        timeout_secs: u64,
        cancelled: usize,
    },

    // -- data inconsistency --------------------------------------------------
    #[error("No backend data source {source_id} for samples of family {family_id}")]
    MissingDataSource { source_id: String, family_id: String },
    #[error("Samples of family {family_id} span genome builds {builds:?} for dataset type {dataset_type}")]
    MixedGenomeBuilds {
        family_id: String,
        dataset_type: String,
        builds: Vec<String>,
    },
    #[error("Unknown gene id(s) {gene_ids:?}")]
    UnknownGene { gene_ids: Vec<String> },
    #[error("Sample {sample_id} is not linked to any individual of the searched families")]
    UnknownSample { sample_id: String },

    // -- precondition ----------------------------------------------------------
    #[error("Search is disabled: {reason}")]
    SearchDisabled { reason: String },

    // -- infrastructure --------------------------------------------------------
    #[error("Pagination cache error for key {key}: {message}")]
    Cache { key: String, message: String },
    #[error("Problem with (de-)serialization: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SearchError {
    fn from(value: serde_json::Error) -> Self {
        SearchError::Serialization(value.to_string())
    }
}

impl SearchError {
    /// Whether the error is a configuration error, rejected before any backend call.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SearchError::InvalidQualityThreshold { .. }
                | SearchError::InvalidConfiguration { .. }
                | SearchError::MissingInheritance { .. }
                | SearchError::CustomAffectedWithoutMode { .. }
        )
    }

    /// Whether the error reports a search that is too large.
    pub fn is_too_large(&self) -> bool {
        matches!(
            self,
            SearchError::TooManyResults { .. }
                | SearchError::TooManyGenes { .. }
                | SearchError::TooManyFamilies { .. }
        )
    }
}

impl Termination for SearchError {
    fn report(self) -> ExitCode {
        if self.is_configuration() {
            ExitCode::from(2)
        } else if self.is_too_large() {
            ExitCode::from(3)
        } else {
            ExitCode::from(1)
        }
    }
}
