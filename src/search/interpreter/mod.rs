//! Translate a `SearchSpec` into predicate and genotype constraint trees.
//!
//! The trees only reference semantic field names.  The backend adapters translate them
//! into their native query representation.  `Predicate::eval` provides the reference
//! semantics on canonical `VariantRecord`s.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    err::SearchError,
    search::schema::{FrequencyCutoff, InSilico, Pathogenicity, PredictionValue, VariantRecord},
};

pub mod consequences;
pub mod frequency;
pub mod genotype;
pub mod in_silico;
pub mod locus;
pub mod quality;

/// Semantic variant-level fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Major consequence terms over all transcripts.
    ConsequenceTerm,
    /// Gene ids over all transcripts.
    GeneId,
    /// ClinVar clinical significance.
    ClinvarSignificance,
    /// HGMD class.
    HgmdClass,
    /// Allele frequency in the population.
    PopulationAf(String),
    /// Allele count in the population.
    PopulationAc(String),
    /// Number of homozygous individuals in the population.
    PopulationHom(String),
    /// Number of hemizygous individuals in the population.
    PopulationHemi(String),
    /// Score or category of an in-silico tool.
    Prediction(String),
    /// Canonical variant id.
    VariantId,
    /// dbSNP id.
    Rsid,
    /// VCF filter values.
    Filters,
    /// Structural variant type.
    SvType,
}

/// Boolean predicate over variant-level fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Always true.
    All,
    /// Negation.
    Not(Box<Predicate>),
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
    /// The field has at least one of the given terms.
    AnyOf { field: Field, values: Vec<String> },
    /// The numeric field lies in the inclusive range.
    Range {
        field: Field,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// The field is absent.
    Missing { field: Field },
    /// The variant overlaps the 1-based inclusive interval.
    Interval { chrom: String, start: i32, end: i32 },
}

impl Predicate {
    /// Build conjunction, flattening nested conjunctions and dropping `All`.
    pub fn and(preds: Vec<Predicate>) -> Predicate {
        let mut result = Vec::new();
        for pred in preds {
            match pred {
                Predicate::All => (),
                Predicate::And(inner) => result.extend(inner),
                other => result.push(other),
            }
        }
        match result.len() {
            0 => Predicate::All,
            1 => result.remove(0),
            _ => Predicate::And(result),
        }
    }

    /// Build disjunction, flattening nested disjunctions; `All` absorbs everything.
    pub fn or(preds: Vec<Predicate>) -> Predicate {
        let mut result = Vec::new();
        for pred in preds {
            match pred {
                Predicate::All => return Predicate::All,
                Predicate::Or(inner) => result.extend(inner),
                other => result.push(other),
            }
        }
        match result.len() {
            1 => result.remove(0),
            _ => Predicate::Or(result),
        }
    }

    /// Shortcut for "value <= max or missing".
    pub fn at_most_or_missing(field: Field, max: f64) -> Predicate {
        Predicate::or(vec![
            Predicate::Range {
                field: field.clone(),
                min: None,
                max: Some(max),
            },
            Predicate::Missing { field },
        ])
    }

    /// Evaluate the predicate on the given record.
    pub fn eval<A: FieldAccess + ?Sized>(&self, record: &A) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Not(inner) => !inner.eval(record),
            Predicate::And(preds) => preds.iter().all(|p| p.eval(record)),
            Predicate::Or(preds) => preds.iter().any(|p| p.eval(record)),
            Predicate::AnyOf { field, values } => record
                .terms(field)
                .iter()
                .any(|term| values.iter().any(|v| v == term)),
            Predicate::Range { field, min, max } => match record.number(field) {
                Some(value) => {
                    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
                }
                None => false,
            },
            Predicate::Missing { field } => {
                record.number(field).is_none() && record.terms(field).is_empty()
            }
            Predicate::Interval { chrom, start, end } => {
                let (v_chrom, v_start, v_end) = record.extent();
                v_chrom == chrom.as_str() && v_start <= *end && v_end >= *start
            }
        }
    }
}

/// Access to semantic fields for evaluating predicates.
pub trait FieldAccess {
    /// Term values of the field, empty if absent.
    fn terms(&self, field: &Field) -> Vec<String>;
    /// Numeric value of the field, `None` if absent or not numeric.
    fn number(&self, field: &Field) -> Option<f64>;
    /// Chromosome and 1-based inclusive extent.
    fn extent(&self) -> (&str, i32, i32);
}

impl FieldAccess for VariantRecord {
    fn terms(&self, field: &Field) -> Vec<String> {
        match field {
            Field::ConsequenceTerm => self
                .transcripts
                .values()
                .flatten()
                .filter_map(|tx| tx.major_consequence.clone())
                .collect(),
            Field::GeneId => self.transcripts.keys().cloned().collect(),
            Field::ClinvarSignificance => self
                .clinvar
                .as_ref()
                .and_then(|c| c.clinical_significance.clone())
                .into_iter()
                .collect(),
            Field::HgmdClass => self
                .hgmd
                .as_ref()
                .and_then(|h| h.class.clone())
                .into_iter()
                .collect(),
            Field::Prediction(tool) => match self.predictions.get(tool) {
                Some(PredictionValue::Category(value)) => vec![value.clone()],
                _ => vec![],
            },
            Field::VariantId => vec![self.variant_id.clone()],
            Field::Rsid => self.rsid.clone().into_iter().collect(),
            Field::Filters => self.filters.clone(),
            Field::SvType => self.sv_type.clone().into_iter().collect(),
            Field::PopulationAf(_)
            | Field::PopulationAc(_)
            | Field::PopulationHom(_)
            | Field::PopulationHemi(_) => vec![],
        }
    }

    fn number(&self, field: &Field) -> Option<f64> {
        match field {
            Field::PopulationAf(pop) => self.populations.get(pop).and_then(|p| p.af),
            Field::PopulationAc(pop) => self
                .populations
                .get(pop)
                .and_then(|p| p.ac)
                .map(|v| v as f64),
            Field::PopulationHom(pop) => self
                .populations
                .get(pop)
                .and_then(|p| p.hom)
                .map(|v| v as f64),
            Field::PopulationHemi(pop) => self
                .populations
                .get(pop)
                .and_then(|p| p.hemi)
                .map(|v| v as f64),
            Field::Prediction(tool) => match self.predictions.get(tool) {
                Some(PredictionValue::Score(value)) => Some(*value),
                _ => None,
            },
            _ => None,
        }
    }

    fn extent(&self) -> (&str, i32, i32) {
        let end = self.end.unwrap_or_else(|| {
            let ref_len = self.reference.as_ref().map_or(1, |r| r.len().max(1)) as i32;
            self.pos + ref_len - 1
        });
        (self.chrom.as_str(), self.pos, end)
    }
}

/// Settings for the predicate builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateSettings {
    /// Frequency at or below which pathogenic variants pass a stricter user cutoff.
    pub pathogenic_override_af: f64,
    /// Population the pathogenic frequency override applies to.
    pub pathogenic_override_population: String,
}

impl Default for PredicateSettings {
    fn default() -> Self {
        Self {
            pathogenic_override_af: 0.05,
            pathogenic_override_population: String::from("gnomad_genomes"),
        }
    }
}

/// Build the variant-level annotation/frequency predicate.
///
/// The consequence filter is widened by the pathogenicity filter.  Frequency and in-silico
/// filters are AND-ed.
pub fn build(
    allowed_consequences: &[String],
    allowed_consequences_secondary: Option<&[String]>,
    pathogenicity: &Pathogenicity,
    frequencies: &IndexMap<String, FrequencyCutoff>,
    in_silico: Option<&InSilico>,
    settings: &PredicateSettings,
) -> Result<Predicate, SearchError> {
    let pathogenic = consequences::pathogenicity_predicate(pathogenicity)?;
    let consequence =
        consequences::consequence_predicate(allowed_consequences, allowed_consequences_secondary);
    let annotation = match (consequence, pathogenic.clone()) {
        (Some(csq), Some(path)) => Predicate::or(vec![csq, path]),
        (Some(csq), None) => csq,
        (None, Some(path)) => path,
        (None, None) => Predicate::All,
    };

    let pathogenic_override = consequences::known_pathogenic_predicate(pathogenicity)?;
    let frequency =
        frequency::frequency_predicate(frequencies, pathogenic_override.as_ref(), settings)?;
    let in_silico = match in_silico {
        Some(in_silico) => in_silico::in_silico_predicate(in_silico)?,
        None => Predicate::All,
    };

    let result = Predicate::and(vec![annotation, frequency, in_silico]);
    tracing::trace!("annotation predicate: {:?}", &result);
    Ok(result)
}
