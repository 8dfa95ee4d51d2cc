//! Per-sample quality thresholds as discretized bins.
//!
//! Quality values are stored in bins of fixed width by the backends.  A threshold is
//! expressed as the set of bins below it that a call must not fall into.

use serde::{Deserialize, Serialize};

use crate::{
    err::SearchError,
    search::{
        interpreter::{Field, Predicate},
        schema::{DatasetType, Genotype, QualityFilter},
    },
};

/// Quality metric of a genotype call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QualityMetric {
    /// Genotype quality.
    Gq,
    /// Allele balance in percent.
    Ab,
    /// Heteroplasmy level in percent.
    Hl,
    /// Structural variant quality score.
    Qs,
}

/// The calls a quality metric applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallScope {
    /// All calls.
    All,
    /// Heterozygous calls only.
    Het,
    /// Calls with at least one alternate allele.
    Alt,
}

impl CallScope {
    /// Whether a call with the given number of alternate alleles is in scope.
    pub fn contains(&self, num_alt: Option<u8>) -> bool {
        match self {
            CallScope::All => true,
            CallScope::Het => num_alt == Some(1),
            CallScope::Alt => matches!(num_alt, Some(n) if n > 0),
        }
    }
}

impl QualityMetric {
    /// Width of the bins.
    pub fn bin_size(&self) -> i32 {
        match self {
            QualityMetric::Gq | QualityMetric::Ab | QualityMetric::Hl => 5,
            QualityMetric::Qs => 10,
        }
    }

    /// The calls the metric applies to.
    pub fn scope(&self) -> CallScope {
        match self {
            QualityMetric::Ab => CallScope::Het,
            QualityMetric::Hl => CallScope::Alt,
            QualityMetric::Gq | QualityMetric::Qs => CallScope::All,
        }
    }

    /// Name of the setting in the quality filter.
    pub fn setting_name(&self) -> String {
        format!("min_{}", self)
    }

    /// The call's value on the threshold scale.
    pub fn value(&self, call: &Genotype) -> Option<f64> {
        match self {
            QualityMetric::Gq => call.gq.map(f64::from),
            QualityMetric::Ab => call.ab.map(|ab| ab * 100.0),
            QualityMetric::Hl => call.hl.map(|hl| hl * 100.0),
            QualityMetric::Qs => call.qs.map(f64::from),
        }
    }

    /// Lower bound of the bin containing `value`.
    pub fn bin_of(&self, value: f64) -> i32 {
        let bin_size = self.bin_size();
        (value.floor() as i32).div_euclid(bin_size) * bin_size
    }

    /// Metrics applicable to calls of the given dataset type.
    pub fn for_dataset_type(dataset_type: DatasetType) -> &'static [QualityMetric] {
        match dataset_type {
            DatasetType::SnvIndel => &[QualityMetric::Gq, QualityMetric::Ab],
            DatasetType::Mito => &[QualityMetric::Gq, QualityMetric::Hl],
            DatasetType::Sv => &[QualityMetric::Gq, QualityMetric::Qs],
        }
    }
}

/// A minimal value for one quality metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_new::new)]
pub struct QualityThreshold {
    /// The metric.
    pub metric: QualityMetric,
    /// The minimal value, a multiple of the bin size.
    pub min: i32,
}

impl QualityThreshold {
    /// Lower bounds of the bins a call must not fall into.
    pub fn disallowed_bins(&self) -> Vec<i32> {
        (0..self.min).step_by(self.metric.bin_size() as usize).collect()
    }

    /// Whether the call passes the threshold.
    ///
    /// Calls out of the metric's scope and calls without a value always pass.
    pub fn passes(&self, call: &Genotype) -> bool {
        if !self.metric.scope().contains(call.num_alt) {
            return true;
        }
        match self.metric.value(call) {
            Some(value) => self.metric.bin_of(value) >= self.min,
            None => true,
        }
    }
}

/// Validated thresholds of the quality filter that apply to `dataset_type`.
pub fn thresholds(
    filter: &QualityFilter,
    dataset_type: DatasetType,
) -> Result<Vec<QualityThreshold>, SearchError> {
    let mut result = Vec::new();
    for (metric, value) in [
        (QualityMetric::Gq, filter.min_gq),
        (QualityMetric::Ab, filter.min_ab),
        (QualityMetric::Hl, filter.min_hl),
        (QualityMetric::Qs, filter.min_qs),
    ] {
        let Some(value) = value else { continue };
        if value < 0 || value % metric.bin_size() != 0 {
            return Err(SearchError::InvalidQualityThreshold {
                field: metric.setting_name(),
                value,
                bin_size: metric.bin_size(),
            });
        }
        if value > 0 && QualityMetric::for_dataset_type(dataset_type).contains(&metric) {
            result.push(QualityThreshold::new(metric, value));
        }
    }
    Ok(result)
}

/// Variant-level predicate for the VCF FILTER setting.
pub fn vcf_filter_predicate(filter: &QualityFilter) -> Predicate {
    if filter.require_pass() {
        Predicate::Missing {
            field: Field::Filters,
        }
    } else {
        Predicate::All
    }
}
