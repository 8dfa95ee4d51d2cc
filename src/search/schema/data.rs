//! Data structures for the family/sample inputs and the canonical variant records.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{common::GenomeRelease, search::sorting::SortKey};

/// Sex of an individual.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum Sex {
    /// Male
    #[serde(rename = "M")]
    Male,
    /// Female
    #[serde(rename = "F")]
    Female,
    /// Unknown sex
    #[default]
    #[serde(rename = "U")]
    Unknown,
}

/// Affected status of an individual.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum AffectedStatus {
    /// Affected
    #[serde(rename = "A")]
    Affected,
    /// Unaffected
    #[serde(rename = "N")]
    Unaffected,
    /// Unknown affected status
    #[default]
    #[serde(rename = "U")]
    Unknown,
}

/// An individual in a family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct Individual {
    /// Individual identifier.
    pub individual_id: String,
    /// Sex of the individual.
    #[serde(default)]
    pub sex: Sex,
    /// Affected status as recorded in the pedigree.
    #[serde(default)]
    pub affected: AffectedStatus,
}

/// A family with its ordered set of individuals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct Family {
    /// Family identifier.
    pub family_id: String,
    /// The individuals, in pedigree order.
    pub individuals: Vec<Individual>,
}

/// The dataset type of a sample's physical data source.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    enum_map::Enum,
)]
pub enum DatasetType {
    /// Short variants (SNVs and indels).
    #[default]
    #[serde(rename = "SNV_INDEL")]
    #[strum(serialize = "SNV_INDEL")]
    SnvIndel,
    /// Structural variants.
    #[serde(rename = "SV")]
    #[strum(serialize = "SV")]
    Sv,
    /// Mitochondrial variants.
    #[serde(rename = "MITO")]
    #[strum(serialize = "MITO")]
    Mito,
}

/// A sample, links an individual to one physical data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Sample identifier as used in the data source.
    pub sample_id: String,
    /// Identifier of the individual.
    pub individual_id: String,
    /// Name of the physical data source (index or table name).
    pub data_source: String,
    /// Dataset type of the data source.
    pub dataset_type: DatasetType,
    /// Genome build of the data source.
    pub genome_version: GenomeRelease,
}

/// Genotype call of one sample at one variant.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genotype {
    /// Sample identifier.
    pub sample_id: String,
    /// Identifier of the individual.
    pub individual_id: String,
    /// Number of alternate alleles, `None` for no-call.
    pub num_alt: Option<u8>,
    /// Allele balance in `[0, 1]`.
    pub ab: Option<f64>,
    /// Genotype quality.
    pub gq: Option<i32>,
    /// Read depth.
    pub dp: Option<i32>,
    /// Copy number (structural variants).
    pub cn: Option<i32>,
    /// Heteroplasmy level in `[0, 1]` (mitochondrial variants).
    pub hl: Option<f64>,
    /// Quality score (structural variants).
    pub qs: Option<i32>,
}

impl Genotype {
    /// Whether the call is heterozygous-alt.
    pub fn is_het(&self) -> bool {
        self.num_alt == Some(1)
    }

    /// Whether the call carries at least one alternate allele.
    pub fn has_alt(&self) -> bool {
        matches!(self.num_alt, Some(n) if n > 0)
    }
}

/// Consequence of a variant on one transcript.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptConsequence {
    /// Transcript identifier.
    pub transcript_id: String,
    /// Gene identifier.
    pub gene_id: String,
    /// Most severe consequence term on the transcript.
    pub major_consequence: Option<String>,
    /// All consequence terms on the transcript.
    #[serde(default)]
    pub consequence_terms: Vec<String>,
    /// HGVS.c notation.
    pub hgvsc: Option<String>,
    /// HGVS.p notation.
    pub hgvsp: Option<String>,
    /// Transcript biotype.
    pub biotype: Option<String>,
    /// Whether this is the canonical transcript of the gene.
    #[serde(default)]
    pub canonical: bool,
}

/// Population frequency information.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulationFrequency {
    /// Allele frequency.
    pub af: Option<f64>,
    /// Allele count.
    pub ac: Option<i64>,
    /// Allele number.
    pub an: Option<i64>,
    /// Number of homozygous individuals.
    pub hom: Option<i64>,
    /// Number of hemizygous individuals.
    pub hemi: Option<i64>,
}

/// Value of an in-silico prediction tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionValue {
    /// Numeric score.
    Score(f64),
    /// Categorical prediction, e.g., "D" for damaging.
    Category(String),
}

/// ClinVar annotation of a variant.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinvarInfo {
    /// ClinVar allele id.
    pub allele_id: Option<i64>,
    /// Clinical significance, e.g., "Pathogenic/Likely_pathogenic".
    pub clinical_significance: Option<String>,
    /// Number of gold stars of the review status.
    pub gold_stars: Option<i32>,
}

/// HGMD annotation of a variant.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HgmdInfo {
    /// HGMD accession.
    pub accession: Option<String>,
    /// HGMD variant class, e.g., "DM".
    pub class: Option<String>,
}

/// Coordinates of a variant in the other genome build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct LiftedCoordinates {
    /// Target genome build.
    pub genome_version: GenomeRelease,
    /// Chromosome in the target build.
    pub chrom: String,
    /// 1-based position in the target build.
    pub pos: i32,
}

/// Canonical in-memory variant record as produced by the normalizer.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantRecord {
    /// Canonical variant key, "chrom-pos-ref-alt" or the structural variant id.
    pub variant_id: String,
    /// Genome build of the record's coordinates.
    pub genome_version: GenomeRelease,
    /// Dataset type of the source.
    pub dataset_type: DatasetType,
    /// Canonical chromosome name.
    pub chrom: String,
    /// 1-based position.
    pub pos: i32,
    /// 1-based end position (structural variants).
    pub end: Option<i32>,
    /// Reference allele (short variants).
    pub reference: Option<String>,
    /// Alternate allele (short variants).
    pub alternative: Option<String>,
    /// Genome-wide linear position.
    pub xpos: i64,
    /// dbSNP identifier.
    pub rsid: Option<String>,
    /// Structural variant type, e.g., "DEL".
    pub sv_type: Option<String>,
    /// VCF filter values, empty for PASS.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Transcript consequences grouped by gene id, in backend order.
    #[serde(default)]
    pub transcripts: IndexMap<String, Vec<TranscriptConsequence>>,
    /// Identifier of the main transcript.
    pub main_transcript_id: Option<String>,
    /// Population frequencies by population id.
    #[serde(default)]
    pub populations: IndexMap<String, PopulationFrequency>,
    /// In-silico predictions by tool name.
    #[serde(default)]
    pub predictions: IndexMap<String, PredictionValue>,
    /// ClinVar annotation.
    pub clinvar: Option<ClinvarInfo>,
    /// HGMD annotation.
    pub hgmd: Option<HgmdInfo>,
    /// Sorted identifiers of families with a matched genotype.
    #[serde(default)]
    pub family_ids: Vec<String>,
    /// Genotype by individual id.
    #[serde(default)]
    pub genotypes: IndexMap<String, Genotype>,
    /// Coordinates in the other genome build, if they could be mapped.
    pub lifted_over: Option<LiftedCoordinates>,
    /// Gene of the compound heterozygous pair this record was returned in.
    pub comp_het_gene_id: Option<String>,
    /// Name of the data source the record came from.
    #[serde(default)]
    pub source_id: String,
    /// Composed sort key.
    #[serde(rename = "_sort", default)]
    pub sort_key: SortKey,
}

impl VariantRecord {
    /// The id of the gene holding the main transcript, if any.
    ///
    /// Falls back to the first gene in the backend order.
    pub fn main_gene_id(&self) -> Option<&str> {
        if let Some(main_transcript_id) = &self.main_transcript_id {
            for (gene_id, txs) in &self.transcripts {
                if txs.iter().any(|tx| &tx.transcript_id == main_transcript_id) {
                    return Some(gene_id.as_str());
                }
            }
        }
        self.transcripts.keys().next().map(|s| s.as_str())
    }

    /// Whether the record is a structural deletion.
    pub fn is_deletion(&self) -> bool {
        self.dataset_type == DatasetType::Sv && self.sv_type.as_deref() == Some("DEL")
    }

    /// Whether the variant is flagged pathogenic in ClinVar or HGMD.
    pub fn is_flagged_pathogenic(
        &self,
        clinvar_terms: &[String],
        hgmd_classes: &[String],
    ) -> bool {
        let clinvar = self
            .clinvar
            .as_ref()
            .and_then(|c| c.clinical_significance.as_ref())
            .map_or(false, |sig| clinvar_terms.contains(sig));
        let hgmd = self
            .hgmd
            .as_ref()
            .and_then(|h| h.class.as_ref())
            .map_or(false, |class| hgmd_classes.contains(class));
        clinvar || hgmd
    }
}

/// One result item of a page, either a single variant or a compound heterozygous pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultItem {
    /// Compound heterozygous pair, ordered by sort key.
    CompoundHet(Box<[VariantRecord; 2]>),
    /// Single variant.
    Single(Box<VariantRecord>),
}

impl ResultItem {
    /// The lead sort key of the item.
    pub fn sort_key(&self) -> &SortKey {
        match self {
            ResultItem::Single(variant) => &variant.sort_key,
            ResultItem::CompoundHet(pair) => std::cmp::min(&pair[0].sort_key, &pair[1].sort_key),
        }
    }

    /// The variant records of the item.
    pub fn variants(&self) -> Vec<&VariantRecord> {
        match self {
            ResultItem::Single(variant) => vec![variant.as_ref()],
            ResultItem::CompoundHet(pair) => pair.iter().collect(),
        }
    }
}
