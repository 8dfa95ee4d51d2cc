//! Compile inheritance settings into per-family genotype constraint trees.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    err::SearchError,
    search::{
        interpreter::quality::{self, QualityThreshold},
        schema::{
            AffectedStatus, DatasetType, Family, Genotype, GenotypeFilter, InheritanceFilter,
            InheritanceMode, QualityFilter, Sample, Sex,
        },
    },
};

/// Suffix of the names of compound heterozygous constraints.
pub const COMP_HET_SUFFIX: &str = "__compound_het";

/// Name of the compound heterozygous constraint of the family.
pub fn comp_het_name(family_id: &str) -> String {
    format!("{}{}", family_id, COMP_HET_SUFFIX)
}

/// Family id of a constraint name.
pub fn family_of_constraint_name(name: &str) -> &str {
    name.strip_suffix(COMP_HET_SUFFIX).unwrap_or(name)
}

/// Boolean constraint over the calls of the samples of one family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenotypeConstraint {
    /// The sample's call has one of the allowed numbers of alternate alleles.
    NumAlt { sample_id: String, allowed: Vec<u8> },
    /// The sample's call does not fall below the quality threshold.
    Quality {
        sample_id: String,
        threshold: QualityThreshold,
    },
    /// The variant is on the given canonical chromosome.
    OnChrom { chrom: String },
    /// Conjunction, true if empty.
    And(Vec<GenotypeConstraint>),
    /// Disjunction, false if empty.
    Or(Vec<GenotypeConstraint>),
}

/// Access to the calls of a variant by sample id.
pub trait CallAccess {
    /// The call of the given sample, if any.
    fn call(&self, sample_id: &str) -> Option<&Genotype>;
}

impl CallAccess for IndexMap<String, Genotype> {
    fn call(&self, sample_id: &str) -> Option<&Genotype> {
        self.get(sample_id)
    }
}

impl GenotypeConstraint {
    /// Build conjunction, flattening nested conjunctions.
    pub fn and(constraints: Vec<GenotypeConstraint>) -> GenotypeConstraint {
        let mut result = Vec::new();
        for constraint in constraints {
            match constraint {
                GenotypeConstraint::And(inner) => result.extend(inner),
                other => result.push(other),
            }
        }
        if result.len() == 1 {
            result.remove(0)
        } else {
            GenotypeConstraint::And(result)
        }
    }

    /// Build disjunction, flattening nested disjunctions.
    pub fn or(constraints: Vec<GenotypeConstraint>) -> GenotypeConstraint {
        let mut result = Vec::new();
        for constraint in constraints {
            match constraint {
                GenotypeConstraint::Or(inner) => result.extend(inner),
                other => result.push(other),
            }
        }
        if result.len() == 1 {
            result.remove(0)
        } else {
            GenotypeConstraint::Or(result)
        }
    }

    /// Evaluate on the calls of a variant on the canonical chromosome `chrom`.
    ///
    /// A sample without call fails `NumAlt` and passes `Quality`.
    pub fn eval<C: CallAccess + ?Sized>(&self, chrom: &str, calls: &C) -> bool {
        match self {
            GenotypeConstraint::NumAlt { sample_id, allowed } => calls
                .call(sample_id)
                .and_then(|call| call.num_alt)
                .map_or(false, |num_alt| allowed.contains(&num_alt)),
            GenotypeConstraint::Quality {
                sample_id,
                threshold,
            } => calls
                .call(sample_id)
                .map_or(true, |call| threshold.passes(call)),
            GenotypeConstraint::OnChrom { chrom: expected } => expected == chrom,
            GenotypeConstraint::And(inner) => inner.iter().all(|c| c.eval(chrom, calls)),
            GenotypeConstraint::Or(inner) => inner.iter().any(|c| c.eval(chrom, calls)),
        }
    }
}

/// Compiled constraints of one family on one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyConstraint {
    /// Family identifier.
    pub family_id: String,
    /// Effective affected status by individual id, after overrides.
    pub affected: IndexMap<String, AffectedStatus>,
    /// Individual id by sample id, for the samples on the data source.
    pub sample_individuals: IndexMap<String, String>,
    /// Constraint for all modes but compound heterozygous.
    pub primary: Option<GenotypeConstraint>,
    /// Constraint for compound heterozygous candidates.
    pub comp_het: Option<GenotypeConstraint>,
}

impl FamilyConstraint {
    /// The constraints with their names as reported back by the backends.
    pub fn named(&self) -> Vec<(String, &GenotypeConstraint)> {
        let mut result = Vec::new();
        if let Some(primary) = &self.primary {
            result.push((self.family_id.clone(), primary));
        }
        if let Some(comp_het) = &self.comp_het {
            result.push((comp_het_name(&self.family_id), comp_het));
        }
        result
    }

    /// Ids of the unaffected individuals.
    pub fn unaffected(&self) -> Vec<&str> {
        self.affected
            .iter()
            .filter(|(_, status)| **status == AffectedStatus::Unaffected)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Settings for compiling the constraints of one data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, derive_new::new)]
pub struct CompileSettings {
    /// Dataset type of the data source.
    pub dataset_type: DatasetType,
    /// Allow homozygous alternate affected calls in compound heterozygous candidates.
    ///
    /// Set for short variants if structural variants are searched as well, as a short
    /// variant under a deletion is called homozygous.
    pub comp_het_allow_hom_alt: bool,
}

/// Default genotype expectation of one individual.
fn default_expectation(mode: InheritanceMode, status: AffectedStatus, sex: Sex) -> GenotypeFilter {
    use AffectedStatus::*;
    use InheritanceMode::*;
    match (mode, status) {
        (_, Unknown) => GenotypeFilter::Any,
        (DeNovo, Affected) => GenotypeFilter::HasAlt,
        (DeNovo, Unaffected) => GenotypeFilter::RefRef,
        (HomozygousRecessive, Affected) | (XLinkedRecessive, Affected) => GenotypeFilter::AltAlt,
        (HomozygousRecessive, Unaffected) => GenotypeFilter::HasRef,
        (XLinkedRecessive, Unaffected) if sex == Sex::Male => GenotypeFilter::RefRef,
        (XLinkedRecessive, Unaffected) => GenotypeFilter::HasRef,
        (CompoundHet, Affected) => GenotypeFilter::RefAlt,
        (CompoundHet, Unaffected) => GenotypeFilter::HasRef,
        (AnyAffected, _) | (Recessive, _) => GenotypeFilter::Any,
    }
}

/// One family's individuals with their samples on the data source.
struct Members<'a> {
    /// (individual id, sample id, effective status, sex)
    entries: Vec<(&'a str, &'a str, AffectedStatus, Sex)>,
}

impl<'a> Members<'a> {
    fn num_alt(sample_id: &str, filter: GenotypeFilter) -> Option<GenotypeConstraint> {
        filter
            .allowed_num_alt()
            .map(|allowed| GenotypeConstraint::NumAlt {
                sample_id: sample_id.to_string(),
                allowed,
            })
    }

    /// Conjunction of per-individual expectations, user overrides taking precedence.
    fn expectations(
        &self,
        overrides: &IndexMap<String, GenotypeFilter>,
        expectation: impl Fn(AffectedStatus, Sex) -> GenotypeFilter,
    ) -> GenotypeConstraint {
        GenotypeConstraint::and(
            self.entries
                .iter()
                .filter_map(|(individual_id, sample_id, status, sex)| {
                    let filter = overrides
                        .get(*individual_id)
                        .copied()
                        .unwrap_or_else(|| expectation(*status, *sex));
                    Self::num_alt(sample_id, filter)
                })
                .collect(),
        )
    }

    /// Disjunction of "has alt" over the samples matching `keep`.
    fn any_has_alt(&self, keep: impl Fn(AffectedStatus) -> bool) -> GenotypeConstraint {
        GenotypeConstraint::or(
            self.entries
                .iter()
                .filter(|(_, _, status, _)| keep(*status))
                .filter_map(|(_, sample_id, _, _)| Self::num_alt(sample_id, GenotypeFilter::HasAlt))
                .collect(),
        )
    }

    fn has_affected(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, _, status, _)| *status == AffectedStatus::Affected)
    }
}

/// Compile the constraints for the families on one data source.
///
/// `family_samples` gives each family with its samples on the data source.  Families
/// without affected individuals on the data source are left out if the mode needs them.
pub fn compile(
    mode: Option<InheritanceMode>,
    family_samples: &[(&Family, Vec<&Sample>)],
    filter: &InheritanceFilter,
    quality_filter: &QualityFilter,
    settings: &CompileSettings,
) -> Result<IndexMap<String, FamilyConstraint>, SearchError> {
    if mode.is_none() && filter.genotype.is_empty() && !filter.affected.is_empty() {
        return Err(SearchError::CustomAffectedWithoutMode {
            individual_ids: filter.affected.keys().cloned().collect(),
        });
    }
    let thresholds = quality::thresholds(quality_filter, settings.dataset_type)?;

    let mut result = IndexMap::new();
    for (family, samples) in family_samples {
        let affected: IndexMap<String, AffectedStatus> = family
            .individuals
            .iter()
            .map(|ind| {
                let status = filter
                    .affected
                    .get(&ind.individual_id)
                    .copied()
                    .unwrap_or(ind.affected);
                (ind.individual_id.clone(), status)
            })
            .collect();
        if mode.is_some()
            && !affected.is_empty()
            && affected.values().all(|s| *s == AffectedStatus::Unknown)
        {
            return Err(SearchError::MissingInheritance {
                family_id: family.family_id.clone(),
            });
        }

        let mut entries = Vec::new();
        let mut sample_individuals = IndexMap::new();
        for sample in samples {
            let individual = family
                .individuals
                .iter()
                .find(|ind| ind.individual_id == sample.individual_id)
                .ok_or_else(|| SearchError::UnknownSample {
                    sample_id: sample.sample_id.clone(),
                })?;
            let status = affected
                .get(&individual.individual_id)
                .copied()
                .unwrap_or_default();
            entries.push((
                individual.individual_id.as_str(),
                sample.sample_id.as_str(),
                status,
                individual.sex,
            ));
            sample_individuals.insert(sample.sample_id.clone(), individual.individual_id.clone());
        }
        let members = Members { entries };

        if mode.is_some() && !members.has_affected() {
            tracing::debug!(
                "skipping family {} without affected samples on data source",
                &family.family_id
            );
            continue;
        }

        let overrides = &filter.genotype;
        let hom_recessive = || {
            members.expectations(overrides, |status, sex| {
                default_expectation(InheritanceMode::HomozygousRecessive, status, sex)
            })
        };
        let x_linked = || {
            GenotypeConstraint::and(vec![
                GenotypeConstraint::OnChrom {
                    chrom: String::from("X"),
                },
                members.expectations(overrides, |status, sex| {
                    default_expectation(InheritanceMode::XLinkedRecessive, status, sex)
                }),
            ])
        };
        let comp_het = || {
            members.expectations(overrides, |status, sex| {
                match default_expectation(InheritanceMode::CompoundHet, status, sex) {
                    GenotypeFilter::RefAlt if settings.comp_het_allow_hom_alt => {
                        GenotypeFilter::HasAlt
                    }
                    other => other,
                }
            })
        };

        let (primary, comp_het) = match mode {
            Some(InheritanceMode::DeNovo) => (
                Some(members.expectations(overrides, |status, sex| {
                    default_expectation(InheritanceMode::DeNovo, status, sex)
                })),
                None,
            ),
            Some(InheritanceMode::HomozygousRecessive) => (Some(hom_recessive()), None),
            Some(InheritanceMode::XLinkedRecessive) => (Some(x_linked()), None),
            Some(InheritanceMode::CompoundHet) => (None, Some(comp_het())),
            Some(InheritanceMode::Recessive) => (
                Some(GenotypeConstraint::or(vec![hom_recessive(), x_linked()])),
                Some(comp_het()),
            ),
            Some(InheritanceMode::AnyAffected) => (
                Some(GenotypeConstraint::and(vec![
                    members.any_has_alt(|status| status == AffectedStatus::Affected),
                    members.expectations(overrides, |_, _| GenotypeFilter::Any),
                ])),
                None,
            ),
            None if !overrides.is_empty() => {
                let custom = members.expectations(overrides, |_, _| GenotypeFilter::Any);
                if custom == GenotypeConstraint::And(vec![]) {
                    (Some(members.any_has_alt(|_| true)), None)
                } else {
                    (Some(custom), None)
                }
            }
            None => (Some(members.any_has_alt(|_| true)), None),
        };

        let quality = quality_constraint(&members, &thresholds, quality_filter.affected_only);
        let with_quality = |constraint: GenotypeConstraint| match &quality {
            Some(quality) => GenotypeConstraint::and(vec![constraint, quality.clone()]),
            None => constraint,
        };

        result.insert(
            family.family_id.clone(),
            FamilyConstraint {
                family_id: family.family_id.clone(),
                affected,
                sample_individuals,
                primary: primary.map(with_quality),
                comp_het: comp_het.map(with_quality),
            },
        );
    }

    tracing::trace!("compiled genotype constraints: {:?}", &result);
    Ok(result)
}

fn quality_constraint(
    members: &Members,
    thresholds: &[QualityThreshold],
    affected_only: bool,
) -> Option<GenotypeConstraint> {
    let mut result = Vec::new();
    for (_, sample_id, status, _) in &members.entries {
        if affected_only && *status != AffectedStatus::Affected {
            continue;
        }
        for threshold in thresholds {
            result.push(GenotypeConstraint::Quality {
                sample_id: sample_id.to_string(),
                threshold: *threshold,
            });
        }
    }
    if result.is_empty() {
        None
    } else {
        Some(GenotypeConstraint::and(result))
    }
}
