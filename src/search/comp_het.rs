//! Pairing of compound heterozygous candidates.
//!
//! The input is the gene-grouped result of the gene aggregation queries.  Per gene, the
//! candidates are filtered by their consequence in that gene and all 2-combinations are
//! validated per family.  A pair is valid for a family if no unaffected individual is
//! heterozygous for both variants.  An affected individual that appears homozygous for
//! a short variant is only accepted if the partner is a deletion overlapping it.

use std::collections::HashSet;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    err::SearchError,
    search::{
        interpreter::{consequences::gene_has_consequence, genotype::FamilyConstraint},
        schema::{AffectedStatus, ResultItem, VariantRecord},
    },
};

/// Affected status of a family's individuals as needed for validating pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingFamily {
    /// Affected individual ids.
    pub affected: Vec<String>,
    /// Unaffected individual ids.
    pub unaffected: Vec<String>,
}

impl From<&FamilyConstraint> for PairingFamily {
    fn from(constraint: &FamilyConstraint) -> Self {
        let ids = |wanted: AffectedStatus| {
            constraint
                .affected
                .iter()
                .filter(|(_, status)| **status == wanted)
                .map(|(id, _)| id.clone())
                .collect()
        };
        Self {
            affected: ids(AffectedStatus::Affected),
            unaffected: ids(AffectedStatus::Unaffected),
        }
    }
}

/// Settings of the pairing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairingSettings {
    /// Primary consequence terms, empty for no consequence filter.
    pub consequences: Vec<String>,
    /// Relaxed consequence terms for one of the two variants.
    pub secondary_consequences: Option<Vec<String>>,
    /// ClinVar significances that count as a primary hit.
    pub pathogenic_clinvar: Vec<String>,
    /// HGMD classes that count as a primary hit.
    pub pathogenic_hgmd: Vec<String>,
    /// Genes with more candidates are skipped.
    pub max_variants_per_gene: usize,
    /// Fail if more genes have at least two candidates.
    pub max_genes: usize,
}

impl PairingSettings {
    fn is_primary_hit(&self, record: &VariantRecord, gene_id: &str) -> bool {
        gene_has_consequence(record, gene_id, &self.consequences)
            || record.is_flagged_pathogenic(&self.pathogenic_clinvar, &self.pathogenic_hgmd)
    }

    fn is_candidate(&self, record: &VariantRecord, gene_id: &str) -> bool {
        if self.is_primary_hit(record, gene_id) {
            return true;
        }
        match &self.secondary_consequences {
            Some(secondary) => gene_has_consequence(record, gene_id, secondary),
            None => false,
        }
    }
}

/// Whether the short variant `snv` lies within the deletion `del`.
fn deletion_covers(del: &VariantRecord, snv: &VariantRecord) -> bool {
    del.is_deletion()
        && !snv.is_deletion()
        && del.chrom == snv.chrom
        && del.pos <= snv.pos
        && snv.pos <= del.end.unwrap_or(del.pos)
}

/// Whether the pair is valid for the family.
fn is_valid_pair(a: &VariantRecord, b: &VariantRecord, family: &PairingFamily) -> bool {
    let num_alt = |record: &VariantRecord, individual_id: &str| {
        record
            .genotypes
            .get(individual_id)
            .and_then(|call| call.num_alt)
    };
    let double_het = family
        .unaffected
        .iter()
        .any(|id| num_alt(a, id) == Some(1) && num_alt(b, id) == Some(1));
    if double_het {
        return false;
    }
    // A short variant within a deletion appears homozygous in the affected.
    family.affected.iter().all(|id| {
        let hom_a = num_alt(a, id) == Some(2) && !a.is_deletion();
        let hom_b = num_alt(b, id) == Some(2) && !b.is_deletion();
        (!hom_a || deletion_covers(b, a)) && (!hom_b || deletion_covers(a, b))
    })
}

/// One valid pair of a gene.
#[derive(Debug, Clone)]
struct GenePair {
    gene_id: String,
    bucket_rank: usize,
    /// Positions in the gene's candidate list, ordered by sort key.
    first: usize,
    second: usize,
    family_ids: Vec<String>,
}

/// Pair the candidates of one gene.
fn pair_gene(
    gene_id: &str,
    bucket_rank: usize,
    candidates: &[VariantRecord],
    families: &IndexMap<String, PairingFamily>,
    settings: &PairingSettings,
) -> Vec<GenePair> {
    let mut result: Vec<GenePair> = Vec::new();
    for (i, j) in (0..candidates.len()).tuple_combinations() {
        let (a, b) = (&candidates[i], &candidates[j]);
        if a.variant_id == b.variant_id {
            continue;
        }
        if settings.secondary_consequences.is_some()
            && !settings.is_primary_hit(a, gene_id)
            && !settings.is_primary_hit(b, gene_id)
        {
            continue;
        }
        let family_ids: Vec<String> = a
            .family_ids
            .iter()
            .filter(|family_id| b.family_ids.contains(family_id))
            .filter(|family_id| {
                families
                    .get(*family_id)
                    .map_or(false, |family| is_valid_pair(a, b, family))
            })
            .cloned()
            .collect();
        if !family_ids.is_empty() {
            result.push(GenePair {
                gene_id: gene_id.to_string(),
                bucket_rank,
                first: i,
                second: j,
                family_ids,
            });
        }
    }
    result
}

/// Build the compound heterozygous pairs from the gene buckets.
///
/// Buckets are given in backend order, their records sorted by sort key.  Returns the
/// pairs sorted by their lead sort key.
pub fn pair_compound_hets(
    buckets: Vec<(String, Vec<VariantRecord>)>,
    families: &IndexMap<String, PairingFamily>,
    settings: &PairingSettings,
) -> Result<Vec<ResultItem>, SearchError> {
    let count = buckets.iter().filter(|(_, records)| records.len() >= 2).count();
    if count > settings.max_genes {
        return Err(SearchError::TooManyGenes {
            count,
            max_genes: settings.max_genes,
        });
    }

    let mut genes: Vec<(String, Vec<VariantRecord>)> = Vec::new();
    for (gene_id, records) in buckets {
        if records.len() > settings.max_variants_per_gene {
            tracing::warn!(
                "skipping gene {} with more than {} compound heterozygous candidates",
                &gene_id,
                settings.max_variants_per_gene
            );
            continue;
        }
        let mut candidates: Vec<VariantRecord> = records
            .into_iter()
            .filter(|record| settings.is_candidate(record, &gene_id))
            .collect();
        if candidates.len() < 2 {
            continue;
        }
        candidates.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        genes.push((gene_id, candidates));
    }

    let pairs: Vec<GenePair> = genes
        .iter()
        .enumerate()
        .flat_map(|(rank, (gene_id, candidates))| {
            pair_gene(gene_id, rank, candidates, families, settings)
        })
        .collect();
    tracing::debug!(
        "{} compound heterozygous pairs in {} genes before resolving shared pairs",
        pairs.len(),
        genes.len()
    );

    // The same pair may be found in several genes, keep it in one.
    let variant_ids = |pair: &GenePair| -> (String, String) {
        let candidates = &genes[pair.bucket_rank].1;
        (
            candidates[pair.first].variant_id.clone(),
            candidates[pair.second].variant_id.clone(),
        )
    };
    let mut by_variants: IndexMap<(String, String), Vec<usize>> = IndexMap::new();
    for (idx, pair) in pairs.iter().enumerate() {
        by_variants.entry(variant_ids(pair)).or_default().push(idx);
    }
    let mut keep: HashSet<usize> = HashSet::new();
    for competing in by_variants.values() {
        let pick = if competing.len() == 1 {
            competing[0]
        } else {
            let pair = &pairs[competing[0]];
            let candidates = &genes[pair.bucket_rank].1;
            let main_genes = [
                candidates[pair.first].main_gene_id(),
                candidates[pair.second].main_gene_id(),
            ];
            main_genes
                .iter()
                .flatten()
                .find_map(|main_gene| {
                    competing
                        .iter()
                        .copied()
                        .find(|idx| pairs[*idx].gene_id == *main_gene)
                })
                .unwrap_or(competing[0])
        };
        keep.insert(pick);
    }

    // The variants of a pair carry the families the pair is valid for.
    let mut result: Vec<ResultItem> = pairs
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep.contains(idx))
        .map(|(_, pair)| {
            let (gene_id, candidates) = &genes[pair.bucket_rank];
            let variant = |pos: usize| {
                let mut record = candidates[pos].clone();
                record.family_ids = pair.family_ids.clone();
                record.comp_het_gene_id = Some(gene_id.clone());
                record
            };
            ResultItem::CompoundHet(Box::new([variant(pair.first), variant(pair.second)]))
        })
        .collect();
    result.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
    Ok(result)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::{
        common::GenomeRelease,
        search::{
            schema::{DatasetType, Genotype, TranscriptConsequence},
            sorting::SortKey,
        },
    };

    fn family() -> IndexMap<String, PairingFamily> {
        let mut result = IndexMap::new();
        result.insert(
            String::from("F1"),
            PairingFamily {
                affected: vec![String::from("child")],
                unaffected: vec![String::from("father"), String::from("mother")],
            },
        );
        result
    }

    fn settings() -> PairingSettings {
        PairingSettings {
            consequences: vec![String::from("missense_variant")],
            max_variants_per_gene: 10,
            max_genes: 10,
            ..Default::default()
        }
    }

    /// Variant at `pos` in `genes` (the first is the main gene) with the calls of child,
    /// father and mother.
    fn variant(pos: i32, genes: &[&str], csq: &str, calls: [u8; 3]) -> VariantRecord {
        let mut genotypes = IndexMap::new();
        for (individual_id, num_alt) in ["child", "father", "mother"].iter().zip(calls) {
            genotypes.insert(
                individual_id.to_string(),
                Genotype {
                    individual_id: individual_id.to_string(),
                    num_alt: Some(num_alt),
                    ..Default::default()
                },
            );
        }
        VariantRecord {
            variant_id: format!("1-{}-A-G", pos),
            genome_version: GenomeRelease::Grch38,
            chrom: String::from("1"),
            pos,
            reference: Some(String::from("A")),
            alternative: Some(String::from("G")),
            xpos: 1_000_000_000 + pos as i64,
            transcripts: genes
                .iter()
                .map(|gene| {
                    (
                        gene.to_string(),
                        vec![TranscriptConsequence {
                            transcript_id: format!("T-{}", gene),
                            gene_id: gene.to_string(),
                            major_consequence: Some(csq.to_string()),
                            ..Default::default()
                        }],
                    )
                })
                .collect(),
            main_transcript_id: genes.first().map(|gene| format!("T-{}", gene)),
            family_ids: vec![String::from("F1")],
            genotypes,
            sort_key: SortKey {
                values: vec![],
                xpos: 1_000_000_000 + pos as i64,
                variant_id: format!("1-{}-A-G", pos),
            },
            ..Default::default()
        }
    }

    fn pairs(items: &[ResultItem]) -> Vec<(String, String, String)> {
        items
            .iter()
            .filter_map(|item| match item {
                ResultItem::CompoundHet(pair) => Some((
                    pair[0].comp_het_gene_id.clone().unwrap_or_default(),
                    pair[0].variant_id.clone(),
                    pair[1].variant_id.clone(),
                )),
                ResultItem::Single(_) => None,
            })
            .collect()
    }

    #[rstest]
    #[case::inherited_from_both_parents([1, 1, 0], [1, 0, 1], true)]
    #[case::father_double_het([1, 1, 0], [1, 1, 0], false)]
    #[case::mother_double_het([1, 0, 1], [1, 1, 1], false)]
    #[case::affected_hom_without_deletion([2, 1, 0], [1, 0, 1], false)]
    fn pair_validity(#[case] first: [u8; 3], #[case] second: [u8; 3], #[case] valid: bool) -> Result<(), anyhow::Error> {
        let buckets = vec![(
            String::from("G1"),
            vec![
                variant(100, &["G1"], "missense_variant", first),
                variant(200, &["G1"], "missense_variant", second),
            ],
        )];
        let result = pair_compound_hets(buckets, &family(), &settings())?;
        assert_eq!(result.len(), usize::from(valid));
        for item in &result {
            let variants = item.variants();
            assert_ne!(variants[0].variant_id, variants[1].variant_id);
        }
        Ok(())
    }

    #[test]
    fn deletion_covering_snv() -> Result<(), anyhow::Error> {
        let snv = variant(150, &["G1"], "missense_variant", [2, 0, 1]);
        let mut del = variant(100, &["G1"], "missense_variant", [1, 1, 0]);
        del.dataset_type = DatasetType::Sv;
        del.sv_type = Some(String::from("DEL"));
        del.end = Some(500);
        let result = pair_compound_hets(
            vec![(String::from("G1"), vec![snv.clone(), del.clone()])],
            &family(),
            &settings(),
        )?;
        assert_eq!(
            pairs(&result),
            vec![(
                String::from("G1"),
                String::from("1-100-A-G"),
                String::from("1-150-A-G")
            )]
        );

        del.end = Some(120);
        let result = pair_compound_hets(
            vec![(String::from("G1"), vec![snv, del])],
            &family(),
            &settings(),
        )?;
        assert!(result.is_empty());
        Ok(())
    }

    #[test]
    fn consequence_in_this_gene() -> Result<(), anyhow::Error> {
        let mut other = variant(200, &["G1"], "missense_variant", [1, 0, 1]);
        other.transcripts.insert(
            String::from("G1"),
            vec![TranscriptConsequence {
                transcript_id: String::from("T-G1"),
                gene_id: String::from("G1"),
                major_consequence: Some(String::from("intron_variant")),
                ..Default::default()
            }],
        );
        let buckets = vec![(
            String::from("G1"),
            vec![variant(100, &["G1"], "missense_variant", [1, 1, 0]), other],
        )];
        assert!(pair_compound_hets(buckets, &family(), &settings())?.is_empty());
        Ok(())
    }

    #[test]
    fn secondary_consequences() -> Result<(), anyhow::Error> {
        let settings = PairingSettings {
            secondary_consequences: Some(vec![String::from("intron_variant")]),
            ..settings()
        };
        let primary = variant(100, &["G1"], "missense_variant", [1, 1, 0]);
        let secondary_a = variant(200, &["G1"], "intron_variant", [1, 0, 1]);
        let secondary_b = variant(300, &["G1"], "intron_variant", [1, 0, 1]);
        let result = pair_compound_hets(
            vec![(String::from("G1"), vec![secondary_b, secondary_a, primary])],
            &family(),
            &settings,
        )?;
        assert_eq!(
            pairs(&result),
            vec![
                (String::from("G1"), String::from("1-100-A-G"), String::from("1-200-A-G")),
                (String::from("G1"), String::from("1-100-A-G"), String::from("1-300-A-G")),
            ]
        );
        Ok(())
    }

    #[test]
    fn shared_pair_kept_in_main_gene() -> Result<(), anyhow::Error> {
        let a = variant(100, &["G2", "G1"], "missense_variant", [1, 1, 0]);
        let b = variant(200, &["G2", "G1"], "missense_variant", [1, 0, 1]);
        let result = pair_compound_hets(
            vec![
                (String::from("G1"), vec![a.clone(), b.clone()]),
                (String::from("G2"), vec![a, b]),
            ],
            &family(),
            &settings(),
        )?;
        assert_eq!(
            pairs(&result),
            vec![(String::from("G2"), String::from("1-100-A-G"), String::from("1-200-A-G"))]
        );
        Ok(())
    }

    #[test]
    fn families_without_valid_pair_are_dropped() -> Result<(), anyhow::Error> {
        let mut families = family();
        families.insert(
            String::from("F2"),
            PairingFamily {
                affected: vec![String::from("child")],
                unaffected: vec![String::from("father")],
            },
        );
        let mut a = variant(100, &["G1"], "missense_variant", [1, 0, 1]);
        let mut b = variant(200, &["G1"], "missense_variant", [1, 1, 0]);
        let mut c = variant(300, &["G1"], "missense_variant", [1, 1, 1]);
        for record in [&mut a, &mut b, &mut c] {
            record.family_ids = vec![String::from("F1"), String::from("F2")];
        }
        let result = pair_compound_hets(
            vec![(String::from("G1"), vec![a, b, c])],
            &families,
            &settings(),
        )?;
        // (a, b) is valid for both families, (a, c) only for F2 as the mother is het
        // for both, (b, c) for none as the father is het for both.
        assert_eq!(
            pairs(&result),
            vec![
                (String::from("G1"), String::from("1-100-A-G"), String::from("1-200-A-G")),
                (String::from("G1"), String::from("1-100-A-G"), String::from("1-300-A-G")),
            ]
        );
        assert_eq!(result[1].variants()[0].family_ids, vec![String::from("F2")]);
        for item in &result {
            let variants = item.variants();
            for family_id in &variants[0].family_ids {
                for unaffected in &families[family_id].unaffected {
                    let hets = variants
                        .iter()
                        .filter(|v| v.genotypes[unaffected].num_alt == Some(1))
                        .count();
                    assert!(hets < 2, "{} is het for both in {}", unaffected, family_id);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn too_many_genes() {
        let buckets = (0..3)
            .map(|i| {
                (
                    format!("G{}", i),
                    vec![
                        variant(100, &["G1"], "missense_variant", [1, 1, 0]),
                        variant(200, &["G1"], "missense_variant", [1, 0, 1]),
                    ],
                )
            })
            .collect();
        let settings = PairingSettings {
            max_genes: 2,
            ..settings()
        };
        assert_eq!(
            pair_compound_hets(buckets, &family(), &settings),
            Err(SearchError::TooManyGenes {
                count: 3,
                max_genes: 2
            })
        );
    }

    #[test]
    #[tracing_test::traced_test]
    fn oversized_gene_is_skipped() -> Result<(), anyhow::Error> {
        let settings = PairingSettings {
            max_variants_per_gene: 1,
            ..settings()
        };
        let buckets = vec![(
            String::from("G1"),
            vec![
                variant(100, &["G1"], "missense_variant", [1, 1, 0]),
                variant(200, &["G1"], "missense_variant", [1, 0, 1]),
            ],
        )];
        assert!(pair_compound_hets(buckets, &family(), &settings)?.is_empty());
        assert!(logs_contain("skipping gene G1 with more than 1"));
        Ok(())
    }
}
