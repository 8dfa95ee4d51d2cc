//! Code for representing search specifications.
//!
//! Search specifications are given as JSON.  The structure mirrors the one of the
//! client: inheritance, locus, frequencies, quality, annotations, pathogenicity and
//! in-silico settings.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    common::GenomeRelease,
    search::{
        interpreter::Predicate,
        schema::data::{AffectedStatus, Family, Sample},
        sorting::SortBy,
    },
};

/// Enumeration of the inheritance modes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InheritanceMode {
    /// De novo variants, absent in all unaffected individuals.
    DeNovo,
    /// Homozygous alternative in affected individuals.
    HomozygousRecessive,
    /// Homozygous alternative in affected individuals on chrX.
    XLinkedRecessive,
    /// Two heterozygous variants in the same gene.
    CompoundHet,
    /// Union of homozygous recessive, X-linked recessive and compound heterozygous.
    Recessive,
    /// Variant present in any affected individual.
    AnyAffected,
}

impl InheritanceMode {
    /// Whether the mode requires the compound heterozygous pairing.
    pub fn is_comp_het(&self) -> bool {
        matches!(self, InheritanceMode::CompoundHet | InheritanceMode::Recessive)
    }
}

/// Genotype expectation for one individual.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GenotypeFilter {
    /// Homozygous reference.
    RefRef,
    /// At least one reference allele.
    HasRef,
    /// Heterozygous.
    RefAlt,
    /// At least one alternate allele.
    HasAlt,
    /// Homozygous alternate.
    AltAlt,
    /// No constraint.
    Any,
}

impl GenotypeFilter {
    /// Allowed numbers of alternate alleles, `None` if there is no constraint.
    pub fn allowed_num_alt(&self) -> Option<Vec<u8>> {
        match self {
            GenotypeFilter::RefRef => Some(vec![0]),
            GenotypeFilter::HasRef => Some(vec![0, 1]),
            GenotypeFilter::RefAlt => Some(vec![1]),
            GenotypeFilter::HasAlt => Some(vec![1, 2]),
            GenotypeFilter::AltAlt => Some(vec![2]),
            GenotypeFilter::Any => None,
        }
    }
}

/// Per-individual overrides of the inheritance filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritanceFilter {
    /// Genotype override by individual id.
    #[serde(default)]
    pub genotype: IndexMap<String, GenotypeFilter>,
    /// Affected status override by individual id.
    #[serde(default)]
    pub affected: IndexMap<String, AffectedStatus>,
}

/// Inheritance settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inheritance {
    /// The inheritance mode, `None` for a plain "has alt allele" or fully custom search.
    #[serde(default)]
    pub mode: Option<InheritanceMode>,
    /// Per-individual overrides.
    #[serde(default)]
    pub filter: InheritanceFilter,
}

/// Locus settings.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locus {
    /// Gene ids to restrict to.
    #[serde(default)]
    pub genes: Vec<String>,
    /// Intervals to restrict to, "chrom:start-end" with 1-based inclusive coordinates.
    #[serde(default)]
    pub intervals: Vec<String>,
    /// Variant ids ("chrom-pos-ref-alt") or rsIDs to restrict to.
    #[serde(default)]
    pub raw_variant_ids: Vec<String>,
    /// Invert the locus filter.
    #[serde(default)]
    pub exclude_locations: bool,
    /// Genome build of the intervals.
    pub genome_version: Option<GenomeRelease>,
}

impl Locus {
    /// Whether any location is given.
    pub fn has_location(&self) -> bool {
        !self.genes.is_empty() || !self.intervals.is_empty() || !self.raw_variant_ids.is_empty()
    }
}

/// Frequency cutoffs for one population.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyCutoff {
    /// Maximal allele frequency.
    pub af: Option<f64>,
    /// Maximal allele count.
    pub ac: Option<i64>,
    /// Maximal number of homozygous and of hemizygous individuals.
    pub hh: Option<i64>,
}

/// Quality thresholds.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFilter {
    /// Minimal allele balance in percent, heterozygous calls only.
    pub min_ab: Option<i32>,
    /// Minimal genotype quality.
    pub min_gq: Option<i32>,
    /// Minimal quality score of structural variant calls.
    pub min_qs: Option<i32>,
    /// Minimal heteroplasmy level in percent, mitochondrial alt calls only.
    pub min_hl: Option<i32>,
    /// Set to "pass" to require an empty FILTER column.
    pub vcf_filter: Option<String>,
    /// Only apply the thresholds to affected individuals.
    #[serde(default)]
    pub affected_only: bool,
}

impl QualityFilter {
    /// Whether the PASS filter is requested.
    pub fn require_pass(&self) -> bool {
        self.vcf_filter
            .as_deref()
            .map_or(false, |f| f.eq_ignore_ascii_case("pass"))
    }
}

/// Pathogenicity overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pathogenicity {
    /// ClinVar categories, e.g., "pathogenic", "likely_pathogenic".
    #[serde(default)]
    pub clinvar: Vec<String>,
    /// HGMD categories, e.g., "disease_causing".
    #[serde(default)]
    pub hgmd: Vec<String>,
}

impl Pathogenicity {
    /// Whether any pathogenicity override is active.
    pub fn is_active(&self) -> bool {
        !self.clinvar.is_empty() || !self.hgmd.is_empty()
    }
}

/// Threshold for one in-silico tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreThreshold {
    /// Minimal score.
    Numeric(f64),
    /// Minimal score given as string or comma-separated categories.
    Text(String),
}

/// In-silico score settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InSilico {
    /// Do not let variants without a score pass.
    #[serde(default)]
    pub require_score: bool,
    /// Thresholds by tool name.
    #[serde(flatten)]
    pub scores: IndexMap<String, ScoreThreshold>,
}

/// The declarative search specification.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSpec {
    /// Inheritance settings.
    #[serde(default)]
    pub inheritance: Inheritance,
    /// Locus settings.
    #[serde(default)]
    pub locus: Locus,
    /// Frequency cutoffs by population id.
    #[serde(default)]
    pub frequencies: IndexMap<String, FrequencyCutoff>,
    /// Quality thresholds.
    #[serde(default)]
    pub quality_filter: QualityFilter,
    /// Allowed consequence terms by category.
    #[serde(default)]
    pub annotations: IndexMap<String, Vec<String>>,
    /// Relaxed consequence terms for the second hit of compound heterozygous pairs.
    pub annotations_secondary: Option<IndexMap<String, Vec<String>>>,
    /// Pathogenicity overrides.
    #[serde(default)]
    pub pathogenicity: Pathogenicity,
    /// In-silico score thresholds.
    pub in_silico: Option<InSilico>,
    /// Additional predicate that is AND-ed to the annotation predicate.
    pub custom_query: Option<Predicate>,
}

impl SearchSpec {
    /// The genome build of the search, defaults to GRCh38.
    pub fn genome_version(&self) -> GenomeRelease {
        self.locus.genome_version.unwrap_or_default()
    }

    /// Terms of all annotation categories.
    pub fn consequence_terms(&self) -> Vec<String> {
        flatten_terms(&self.annotations)
    }

    /// Terms of all secondary annotation categories.
    pub fn secondary_consequence_terms(&self) -> Option<Vec<String>> {
        self.annotations_secondary
            .as_ref()
            .map(flatten_terms)
            .filter(|terms| !terms.is_empty())
    }
}

/// Flatten and de-duplicate the terms of all categories, keeping the first occurence order.
fn flatten_terms(annotations: &IndexMap<String, Vec<String>>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for term in annotations.values().flatten() {
        if !result.contains(term) {
            result.push(term.clone());
        }
    }
    result
}

/// A full search request: the specification and the searched families.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// The search specification.
    pub search: SearchSpec,
    /// The searched families.
    pub families: Vec<Family>,
    /// The samples of the searched families' individuals.
    pub samples: Vec<Sample>,
    /// Sort option.
    #[serde(default)]
    pub sort: SortBy,
}
