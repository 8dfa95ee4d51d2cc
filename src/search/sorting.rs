//! Code for composing sort keys of variant records.
//!
//! All components of a `SortKey` sort ascending.  Fields where higher is better are negated
//! when composing the key.  Missing values use the infinity sentinels: `+inf` for
//! ascending-is-better fields and `-inf` for descending-is-better fields, such that both
//! end up last once the direction has been applied.  The genomic position and the variant
//! id are always appended as tie breakers so the order is total.

use serde::{Deserialize, Serialize};

/// Sort option selected by the user.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortBy {
    /// Genomic position.
    #[default]
    Xpos,
    /// Severity of the main transcript consequence.
    ProteinConsequence,
    /// ClinVar/HGMD pathogenicity.
    Pathogenicity,
    /// gnomAD genomes allele frequency.
    Gnomad,
    /// gnomAD exomes allele frequency.
    GnomadExomes,
    /// Allele frequency in the callset.
    CallsetAf,
    /// CADD score.
    Cadd,
    /// REVEL score.
    Revel,
    /// SpliceAI score.
    SpliceAi,
    /// Family identifier.
    FamilyGuid,
}

/// Semantic sort field, translated by the backend adapters to physical fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortFieldKind {
    /// Rank of the main transcript's major consequence.
    ConsequenceRank,
    /// Rank of the ClinVar clinical significance.
    ClinvarRank,
    /// Rank of the HGMD class.
    HgmdRank,
    /// Allele frequency in the given population.
    PopulationAf(String),
    /// Score of the given in-silico tool.
    Prediction(String),
    /// Rank of the first matched family in the request's family order.
    FamilyRank,
}

/// One field of the sort specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_new::new)]
pub struct SortField {
    /// The semantic field.
    pub kind: SortFieldKind,
    /// Whether higher values are better.
    pub descending: bool,
}

impl SortField {
    /// Sentinel used by backends when the field is missing.
    pub fn missing_sentinel(&self) -> f64 {
        if self.descending {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        }
    }

    /// Convert a raw backend value (or its absence) into the ascending key component.
    pub fn to_ascending(&self, raw: Option<f64>) -> SortValue {
        let raw = raw.filter(|v| !v.is_nan()).unwrap_or(self.missing_sentinel());
        if self.descending {
            SortValue(-raw)
        } else {
            SortValue(raw)
        }
    }
}

impl SortBy {
    /// The semantic sort fields, without the positional tie breaker.
    pub fn fields(&self) -> Vec<SortField> {
        use SortFieldKind::*;
        match self {
            SortBy::Xpos => vec![],
            SortBy::ProteinConsequence => vec![SortField::new(ConsequenceRank, false)],
            SortBy::Pathogenicity => vec![
                SortField::new(ClinvarRank, false),
                SortField::new(HgmdRank, false),
                SortField::new(ConsequenceRank, false),
            ],
            SortBy::Gnomad => vec![SortField::new(
                PopulationAf(String::from("gnomad_genomes")),
                false,
            )],
            SortBy::GnomadExomes => vec![SortField::new(
                PopulationAf(String::from("gnomad_exomes")),
                false,
            )],
            SortBy::CallsetAf => vec![SortField::new(
                PopulationAf(String::from("callset")),
                false,
            )],
            SortBy::Cadd => vec![SortField::new(Prediction(String::from("cadd")), true)],
            SortBy::Revel => vec![SortField::new(Prediction(String::from("revel")), true)],
            SortBy::SpliceAi => vec![SortField::new(Prediction(String::from("splice_ai")), true)],
            SortBy::FamilyGuid => vec![SortField::new(FamilyRank, false)],
        }
    }
}

/// Rank of a ClinVar clinical significance, lower is more pathogenic.
pub fn clinvar_rank(significance: &str) -> Option<f64> {
    const RANKS: &[&str] = &[
        "Pathogenic",
        "Pathogenic/Likely_pathogenic",
        "Likely_pathogenic",
        "Conflicting_interpretations_of_pathogenicity",
        "Uncertain_significance",
        "Likely_benign",
        "Benign/Likely_benign",
        "Benign",
    ];
    RANKS
        .iter()
        .position(|r| *r == significance)
        .map(|idx| idx as f64)
}

/// Rank of an HGMD class, lower is more pathogenic.
pub fn hgmd_rank(class: &str) -> Option<f64> {
    const RANKS: &[&str] = &["DM", "DM?", "DP", "DFP", "FP", "FTV", "R"];
    RANKS
        .iter()
        .position(|r| *r == class)
        .map(|idx| idx as f64)
}

/// One ascending component of a sort key.
///
/// Infinite values are serialized as the strings `"Infinity"` and `"-Infinity"` as JSON
/// cannot represent them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortValue(pub f64);

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for SortValue {}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Helper for (de-)serializing `SortValue`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SortValueRepr {
    Number(f64),
    Sentinel(String),
}

impl Serialize for SortValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let repr = if self.0 == f64::INFINITY {
            SortValueRepr::Sentinel(String::from("Infinity"))
        } else if self.0 == f64::NEG_INFINITY {
            SortValueRepr::Sentinel(String::from("-Infinity"))
        } else {
            SortValueRepr::Number(self.0)
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SortValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match SortValueRepr::deserialize(deserializer)? {
            SortValueRepr::Number(value) => Ok(SortValue(value)),
            SortValueRepr::Sentinel(s) => parse_sentinel(&s)
                .map(SortValue)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid sort value: {}", s))),
        }
    }
}

/// Parse the infinity sentinel strings.
pub fn parse_sentinel(s: &str) -> Option<f64> {
    match s {
        "Infinity" | "+Infinity" | "inf" => Some(f64::INFINITY),
        "-Infinity" | "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

/// Composed sort key of a variant record.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SortKey {
    /// Ascending components for the requested sort fields.
    pub values: Vec<SortValue>,
    /// Genomic position tie breaker.
    pub xpos: i64,
    /// Final tie breaker for distinct variants at the same position.
    pub variant_id: String,
}

impl SortKey {
    /// Construct from raw values of the given fields.
    pub fn from_raw(fields: &[SortField], raw: &[Option<f64>], xpos: i64, variant_id: &str) -> Self {
        Self {
            values: fields
                .iter()
                .enumerate()
                .map(|(i, field)| field.to_ascending(raw.get(i).copied().flatten()))
                .collect(),
            xpos,
            variant_id: variant_id.to_owned(),
        }
    }
}

/// Encode a float into a `u64` that preserves the order of `f64::total_cmp`.
///
/// Used by backends whose sort keys cannot be negative.
pub fn encode_unsigned(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Inverse of `encode_unsigned`.
pub fn decode_unsigned(encoded: u64) -> f64 {
    let bits = if encoded >> 63 == 1 {
        encoded & !(1 << 63)
    } else {
        !encoded
    };
    f64::from_bits(bits)
}
