//! Consequence and pathogenicity parts of the annotation predicate.

use crate::{
    err::SearchError,
    search::{
        interpreter::{Field, Predicate},
        schema::Pathogenicity,
    },
};

/// Sentinel terms that select variants without any transcript consequence.
const INTERGENIC_TERMS: &[&str] = &["intergenic", "intergenic_variant"];

/// Sequence ontology terms by severity, most severe first.
pub const CONSEQUENCE_RANKS: &[&str] = &[
    "transcript_ablation",
    "splice_acceptor_variant",
    "splice_donor_variant",
    "stop_gained",
    "frameshift_variant",
    "stop_lost",
    "start_lost",
    "transcript_amplification",
    "inframe_insertion",
    "inframe_deletion",
    "missense_variant",
    "protein_altering_variant",
    "splice_region_variant",
    "incomplete_terminal_codon_variant",
    "start_retained_variant",
    "stop_retained_variant",
    "synonymous_variant",
    "coding_sequence_variant",
    "mature_miRNA_variant",
    "5_prime_UTR_variant",
    "3_prime_UTR_variant",
    "non_coding_transcript_exon_variant",
    "intron_variant",
    "NMD_transcript_variant",
    "non_coding_transcript_variant",
    "upstream_gene_variant",
    "downstream_gene_variant",
    "TFBS_ablation",
    "TFBS_amplification",
    "TF_binding_site_variant",
    "regulatory_region_ablation",
    "regulatory_region_amplification",
    "feature_elongation",
    "regulatory_region_variant",
    "feature_truncation",
    "intergenic_variant",
];

/// Rank of a consequence term, lower is more severe.
pub fn consequence_rank(term: &str) -> Option<f64> {
    CONSEQUENCE_RANKS
        .iter()
        .position(|t| *t == term)
        .map(|idx| idx as f64)
}

/// ClinVar clinical significance values by user-facing category.
pub fn clinvar_significances(category: &str) -> Option<&'static [&'static str]> {
    Some(match category {
        "pathogenic" => &["Pathogenic", "Pathogenic/Likely_pathogenic"],
        "likely_pathogenic" => &["Likely_pathogenic", "Pathogenic/Likely_pathogenic"],
        "vus_or_conflicting" => &[
            "Conflicting_interpretations_of_pathogenicity",
            "Uncertain_significance",
            "not_provided",
            "other",
        ],
        "likely_benign" => &["Likely_benign", "Benign/Likely_benign"],
        "benign" => &["Benign", "Benign/Likely_benign"],
        _ => return None,
    })
}

/// HGMD classes by user-facing category.
pub fn hgmd_classes(category: &str) -> Option<&'static [&'static str]> {
    Some(match category {
        "disease_causing" => &["DM"],
        "likely_disease_causing" => &["DM?"],
        "hgmd_other" => &["DP", "DFP", "FP", "FTV"],
        _ => return None,
    })
}

/// ClinVar categories considered known-pathogenic.
const PATHOGENIC_CLINVAR: &[&str] = &["pathogenic", "likely_pathogenic"];
/// HGMD categories considered known-pathogenic.
const PATHOGENIC_HGMD: &[&str] = &["disease_causing", "likely_disease_causing"];

/// Expand categories into sorted, de-duplicated values.
fn expand(
    categories: &[String],
    field: &str,
    lookup: fn(&str) -> Option<&'static [&'static str]>,
) -> Result<Vec<String>, SearchError> {
    let mut values = Vec::new();
    for category in categories {
        let expanded = lookup(category).ok_or_else(|| SearchError::InvalidConfiguration {
            field: field.to_string(),
            message: format!("unknown category {:?}", category),
        })?;
        values.extend(expanded.iter().map(|s| s.to_string()));
    }
    values.sort();
    values.dedup();
    Ok(values)
}

/// ClinVar significance values and HGMD classes selected by `pathogenicity`.
pub fn pathogenicity_values(
    pathogenicity: &Pathogenicity,
) -> Result<(Vec<String>, Vec<String>), SearchError> {
    Ok((
        expand(
            &pathogenicity.clinvar,
            "pathogenicity.clinvar",
            clinvar_significances,
        )?,
        expand(&pathogenicity.hgmd, "pathogenicity.hgmd", hgmd_classes)?,
    ))
}

fn values_predicate(clinvar: Vec<String>, hgmd: Vec<String>) -> Option<Predicate> {
    let mut preds = Vec::new();
    if !clinvar.is_empty() {
        preds.push(Predicate::AnyOf {
            field: Field::ClinvarSignificance,
            values: clinvar,
        });
    }
    if !hgmd.is_empty() {
        preds.push(Predicate::AnyOf {
            field: Field::HgmdClass,
            values: hgmd,
        });
    }
    if preds.is_empty() {
        None
    } else {
        Some(Predicate::or(preds))
    }
}

/// Predicate for the user's pathogenicity selection, `None` if nothing is selected.
pub fn pathogenicity_predicate(
    pathogenicity: &Pathogenicity,
) -> Result<Option<Predicate>, SearchError> {
    let (clinvar, hgmd) = pathogenicity_values(pathogenicity)?;
    Ok(values_predicate(clinvar, hgmd))
}

/// Predicate for the known-pathogenic part of the user's pathogenicity selection.
pub fn known_pathogenic_predicate(
    pathogenicity: &Pathogenicity,
) -> Result<Option<Predicate>, SearchError> {
    let restricted = Pathogenicity {
        clinvar: pathogenicity
            .clinvar
            .iter()
            .filter(|c| PATHOGENIC_CLINVAR.contains(&c.as_str()))
            .cloned()
            .collect(),
        hgmd: pathogenicity
            .hgmd
            .iter()
            .filter(|c| PATHOGENIC_HGMD.contains(&c.as_str()))
            .cloned()
            .collect(),
    };
    pathogenicity_predicate(&restricted)
}

/// Predicate for the allowed consequence terms, `None` if no terms are given.
///
/// Secondary terms are only passed for the gene aggregation query of compound
/// heterozygous searches; the pairing requires a primary term on one variant.
pub fn consequence_predicate(
    allowed: &[String],
    allowed_secondary: Option<&[String]>,
) -> Option<Predicate> {
    let mut terms: Vec<String> = Vec::new();
    for term in allowed.iter().chain(allowed_secondary.unwrap_or_default()) {
        if !terms.contains(term) {
            terms.push(term.clone());
        }
    }
    if terms.is_empty() {
        return None;
    }

    let intergenic = terms
        .iter()
        .any(|term| INTERGENIC_TERMS.contains(&term.as_str()));
    let mut preds = vec![Predicate::AnyOf {
        field: Field::ConsequenceTerm,
        values: terms,
    }];
    if intergenic {
        preds.push(Predicate::Missing {
            field: Field::ConsequenceTerm,
        });
    }
    Some(Predicate::or(preds))
}

/// Whether any transcript of the given gene has a major consequence in `allowed`.
///
/// Used by the compound heterozygous pairing for gene-specific checks.
pub fn gene_has_consequence(
    record: &crate::search::schema::VariantRecord,
    gene_id: &str,
    allowed: &[String],
) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match record.transcripts.get(gene_id) {
        Some(txs) if !txs.is_empty() => txs.iter().any(|tx| {
            tx.major_consequence
                .as_ref()
                .map_or(false, |csq| allowed.contains(csq))
        }),
        _ => {
            record.transcripts.values().all(|txs| txs.is_empty())
                && allowed
                    .iter()
                    .any(|term| INTERGENIC_TERMS.contains(&term.as_str()))
        }
    }
}
