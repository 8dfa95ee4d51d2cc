//! Map raw backend rows to canonical variant records.
//!
//! There is one mapping function per row schema.  The common post-processing (family
//! membership, liftover, sort key) is shared.

use indexmap::IndexMap;

use crate::{
    common::{canonicalize_chrom, xpos, GenomeRelease},
    err::SearchError,
    search::{
        backend::{
            columnar::{self, ColumnarCall},
            index::{self, IndexGenotype},
            RawHit, RawRow, RawSortValues, SourceInfo,
        },
        interpreter::{consequences::consequence_rank, genotype::family_of_constraint_name},
        liftover::CoordinateMapper,
        lookup::FamilyIndex,
        schema::{
            ClinvarInfo, Genotype, HgmdInfo, PopulationFrequency, PredictionValue,
            TranscriptConsequence, VariantRecord,
        },
        sorting::{decode_unsigned, SortField, SortKey, SortValue},
    },
};

/// What the normalizer needs to know besides the row.
pub struct NormalizeContext<'a> {
    /// The data source the rows come from.
    pub source: &'a SourceInfo,
    /// Family/individual of each sample.
    pub families: &'a FamilyIndex,
    /// Mapper to the other genome build.
    pub mapper: &'a dyn CoordinateMapper,
    /// Requested sort fields.
    pub sort: &'a [SortField],
    /// Genome build of the search.  Rows of the other build sort by their lifted
    /// position.
    pub search_build: GenomeRelease,
    /// Whether the inheritance filter was applied, i.e., matched names are reported.
    pub named_constraints: bool,
}

/// Group transcripts by gene id, keeping their order.
fn group_by_gene(
    transcripts: Vec<TranscriptConsequence>,
) -> IndexMap<String, Vec<TranscriptConsequence>> {
    let mut result: IndexMap<String, Vec<TranscriptConsequence>> = IndexMap::new();
    for tx in transcripts {
        result.entry(tx.gene_id.clone()).or_default().push(tx);
    }
    result
}

fn genotype_from_index(call: &IndexGenotype) -> Genotype {
    Genotype {
        sample_id: call.sample_id.clone(),
        num_alt: u8::try_from(call.num_alt).ok(),
        ab: call.ab,
        gq: call.gq,
        dp: call.dp,
        cn: call.cn,
        hl: call.hl,
        qs: call.qs,
        ..Default::default()
    }
}

fn genotype_from_columnar(call: &ColumnarCall) -> Genotype {
    Genotype {
        sample_id: call.sample_id.clone(),
        num_alt: call.num_alt,
        ab: call.ab,
        gq: call.gq,
        dp: call.dp,
        cn: call.cn,
        hl: call.hl,
        qs: call.qs,
        ..Default::default()
    }
}

/// Map a document of the legacy index schema.
///
/// Transcripts come as parallel arrays and are ordered by severity here.  Population
/// frequencies and predictions are collected from the flat `{population}_{metric}` and
/// `{tool}_score` fields.
fn from_legacy(doc: index::LegacyDocument) -> (VariantRecord, Vec<Genotype>) {
    let mut transcripts: Vec<TranscriptConsequence> = doc
        .transcript_ids
        .iter()
        .enumerate()
        .map(|(i, transcript_id)| TranscriptConsequence {
            transcript_id: transcript_id.clone(),
            gene_id: doc.gene_ids.get(i).cloned().unwrap_or_default(),
            major_consequence: doc.major_consequences.get(i).cloned().flatten(),
            ..Default::default()
        })
        .collect();
    transcripts.sort_by(|a, b| {
        let rank = |tx: &TranscriptConsequence| {
            tx.major_consequence
                .as_deref()
                .and_then(consequence_rank)
                .unwrap_or(f64::INFINITY)
        };
        rank(a).total_cmp(&rank(b))
    });

    let mut populations: IndexMap<String, PopulationFrequency> = IndexMap::new();
    let mut predictions = IndexMap::new();
    for (key, value) in &doc.fields {
        if let Some(tool) = key.strip_suffix("_score") {
            let prediction = match value {
                serde_json::Value::Number(n) => n.as_f64().map(PredictionValue::Score),
                serde_json::Value::String(s) => Some(PredictionValue::Category(s.clone())),
                _ => None,
            };
            if let Some(prediction) = prediction {
                predictions.insert(tool.to_string(), prediction);
            }
            continue;
        }
        let Some((pop, metric)) = key.rsplit_once('_') else {
            continue;
        };
        let freq = populations.entry(pop.to_string()).or_default();
        match metric {
            "AF" => freq.af = value.as_f64(),
            "AC" => freq.ac = value.as_i64(),
            "AN" => freq.an = value.as_i64(),
            "Hom" => freq.hom = value.as_i64(),
            "Hemi" => freq.hemi = value.as_i64(),
            _ => tracing::trace!("ignoring legacy field {}", key),
        }
    }
    populations.retain(|_, freq| *freq != PopulationFrequency::default());

    let clinvar = if doc.clinvar_clinical_significance.is_some() || doc.clinvar_allele_id.is_some()
    {
        Some(ClinvarInfo {
            allele_id: doc.clinvar_allele_id,
            clinical_significance: doc.clinvar_clinical_significance.clone(),
            gold_stars: doc.clinvar_gold_stars,
        })
    } else {
        None
    };
    let hgmd = if doc.hgmd_class.is_some() || doc.hgmd_accession.is_some() {
        Some(HgmdInfo {
            accession: doc.hgmd_accession.clone(),
            class: doc.hgmd_class.clone(),
        })
    } else {
        None
    };

    let main_transcript_id = transcripts.first().map(|tx| tx.transcript_id.clone());
    let record = VariantRecord {
        variant_id: doc.variant_id,
        chrom: canonicalize_chrom(&doc.contig),
        pos: doc.start,
        end: doc.end,
        reference: doc.reference,
        alternative: doc.alternative,
        xpos: doc.xpos,
        rsid: doc.rsid,
        sv_type: doc.sv_type,
        filters: doc.filters,
        transcripts: group_by_gene(transcripts),
        main_transcript_id,
        populations,
        predictions,
        clinvar,
        hgmd,
        ..Default::default()
    };
    let calls = doc.genotypes.iter().map(genotype_from_index).collect();
    (record, calls)
}

/// Map a document of the current index schema.
fn from_document(doc: index::Document) -> (VariantRecord, Vec<Genotype>) {
    let main_transcript_id = doc
        .sorted_transcript_consequences
        .first()
        .map(|tx| tx.transcript_id.clone());
    let calls = doc.genotypes.iter().map(genotype_from_index).collect();
    let record = VariantRecord {
        variant_id: doc.variant_id,
        chrom: canonicalize_chrom(&doc.contig),
        pos: doc.start,
        end: doc.end,
        reference: doc.reference,
        alternative: doc.alternative,
        xpos: doc.xpos,
        rsid: doc.rsid,
        sv_type: doc.sv_type,
        filters: doc.filters,
        transcripts: group_by_gene(doc.sorted_transcript_consequences),
        main_transcript_id,
        populations: doc.populations,
        predictions: doc.predictions,
        clinvar: doc.clinvar,
        hgmd: doc.hgmd,
        ..Default::default()
    };
    (record, calls)
}

/// Map a columnar row.
fn from_columnar(row: columnar::Row) -> (VariantRecord, Vec<Genotype>) {
    let main_transcript_id = row.transcripts.first().map(|tx| tx.transcript_id.clone());
    let calls = row.calls.iter().map(genotype_from_columnar).collect();
    let record = VariantRecord {
        variant_id: row.variant_id,
        chrom: canonicalize_chrom(&row.chrom),
        pos: row.pos,
        end: row.end,
        reference: row.reference,
        alternative: row.alternative,
        xpos: row.xpos,
        rsid: row.rsid,
        sv_type: row.sv_type,
        filters: row.filters,
        transcripts: group_by_gene(row.transcripts),
        main_transcript_id,
        populations: row.populations,
        predictions: row.predictions,
        clinvar: row.clinvar,
        hgmd: row.hgmd,
        ..Default::default()
    };
    (record, calls)
}

/// Decode the backend sort values into the ascending key components.
fn decode_sort_values(values: &RawSortValues) -> Result<Vec<SortValue>, SearchError> {
    match values {
        RawSortValues::Json(values) => values
            .iter()
            .map(|value| Ok(serde_json::from_value::<SortValue>(value.clone())?))
            .collect(),
        RawSortValues::Unsigned(values) => Ok(values
            .iter()
            .map(|value| SortValue(decode_unsigned(*value)))
            .collect()),
    }
}

/// Normalize one raw hit into a variant record.
pub fn normalize(hit: RawHit, ctx: &NormalizeContext) -> Result<VariantRecord, SearchError> {
    let values = decode_sort_values(&hit.sort_values)?;
    if values.len() != ctx.sort.len() {
        return Err(SearchError::Serialization(format!(
            "expected {} sort values from {} but got {}",
            ctx.sort.len(),
            &ctx.source.source_id,
            values.len()
        )));
    }

    let (mut record, calls) = match hit.row {
        RawRow::IndexLegacy(doc) => from_legacy(doc),
        RawRow::Index(doc) => from_document(doc),
        RawRow::Columnar(row) => from_columnar(row),
    };
    record.genome_version = ctx.source.genome_version;
    record.dataset_type = ctx.source.dataset_type;
    record.source_id = ctx.source.source_id.clone();

    // Calls of samples outside of the searched families are not returned.
    let mut family_ids: Vec<String> = Vec::new();
    for mut call in calls {
        if let Some(membership) = ctx.families.sample(&call.sample_id) {
            if !ctx.named_constraints && call.has_alt() {
                family_ids.push(membership.family_id.clone());
            }
            call.individual_id = membership.individual_id.clone();
            record.genotypes.insert(call.individual_id.clone(), call);
        }
    }
    if ctx.named_constraints {
        family_ids = hit
            .matched_constraints
            .iter()
            .map(|name| family_of_constraint_name(name).to_string())
            .collect();
    }
    family_ids.sort();
    family_ids.dedup();
    record.family_ids = family_ids;

    record.lifted_over = ctx
        .mapper
        .map(record.genome_version, &record.chrom, record.pos);
    let sort_xpos = match &record.lifted_over {
        Some(lifted)
            if record.genome_version != ctx.search_build
                && lifted.genome_version == ctx.search_build =>
        {
            xpos(&lifted.chrom, lifted.pos)
        }
        _ => record.xpos,
    };
    record.sort_key = SortKey {
        values,
        xpos: sort_xpos,
        variant_id: record.variant_id.clone(),
    };
    Ok(record)
}
