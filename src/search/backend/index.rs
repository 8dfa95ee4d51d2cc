//! Inverted-index backend.
//!
//! Each data source is an index of JSON documents.  On loading, every document is
//! inverted into term lists and numeric fields, including the per-sample genotype terms
//! `samples_num_alt_1`, `samples_num_alt_2`, `samples_no_call` and the quality bin terms
//! `samples_{metric}_{lo}_to_{hi}`.  Queries are boolean term/range queries over these
//! physical fields, with named clauses for the per-family genotype constraints.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    common::{canonicalize_chrom, GenomeRelease},
    err::SearchError,
    search::{
        backend::{
            check_window, BackendQueryAdapter, FamilyFilter, GeneBucket,
            QueryMode, QueryRequest, QueryResponse, RawHit, RawRow, RawSortValues, RunningTask,
            SourceInfo, TaskRegistry, SCAN_CHUNK_SIZE,
        },
        interpreter::{
            consequences::consequence_rank,
            genotype::{family_of_constraint_name, GenotypeConstraint},
            quality::QualityMetric,
            Field, Predicate,
        },
        schema::{
            ClinvarInfo, DatasetType, HgmdInfo, PopulationFrequency, PredictionValue,
            TranscriptConsequence,
        },
        sorting::{clinvar_rank, hgmd_rank, SortFieldKind, SortValue},
    },
};

/// Genotype call as stored in the index.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexGenotype {
    /// Sample identifier.
    pub sample_id: String,
    /// Number of alternate alleles, -1 for no-call.
    pub num_alt: i8,
    /// Allele balance.
    pub ab: Option<f64>,
    /// Genotype quality.
    pub gq: Option<i32>,
    /// Read depth.
    pub dp: Option<i32>,
    /// Copy number.
    pub cn: Option<i32>,
    /// Heteroplasmy level.
    pub hl: Option<f64>,
    /// Quality score.
    pub qs: Option<i32>,
}

/// Document of the legacy schema (`schemaVersion` 1).
///
/// Transcripts are flat parallel arrays in no particular order.  Population frequencies
/// and predictions are flat fields such as `gnomad_genomes_AF` and `cadd_score`.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDocument {
    pub variant_id: String,
    pub contig: String,
    pub start: i32,
    pub end: Option<i32>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    #[serde(rename = "alt")]
    pub alternative: Option<String>,
    pub xpos: i64,
    pub rsid: Option<String>,
    pub sv_type: Option<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub transcript_ids: Vec<String>,
    #[serde(default)]
    pub gene_ids: Vec<String>,
    #[serde(default)]
    pub major_consequences: Vec<Option<String>>,
    pub clinvar_clinical_significance: Option<String>,
    pub clinvar_allele_id: Option<i64>,
    pub clinvar_gold_stars: Option<i32>,
    pub hgmd_class: Option<String>,
    pub hgmd_accession: Option<String>,
    /// Flat numeric and categorical fields.
    #[serde(default)]
    pub fields: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub genotypes: Vec<IndexGenotype>,
}

/// Document of the current schema (`schemaVersion` 2).
///
/// Transcripts are sorted with the main transcript first.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub variant_id: String,
    pub contig: String,
    pub start: i32,
    pub end: Option<i32>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    #[serde(rename = "alt")]
    pub alternative: Option<String>,
    pub xpos: i64,
    pub rsid: Option<String>,
    pub sv_type: Option<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub sorted_transcript_consequences: Vec<TranscriptConsequence>,
    pub main_transcript_id: Option<String>,
    pub clinvar: Option<ClinvarInfo>,
    pub hgmd: Option<HgmdInfo>,
    #[serde(default)]
    pub populations: IndexMap<String, PopulationFrequency>,
    #[serde(default)]
    pub predictions: IndexMap<String, PredictionValue>,
    #[serde(default)]
    pub genotypes: Vec<IndexGenotype>,
}

/// One index as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSource {
    /// Index name.
    pub name: String,
    /// Genome build.
    pub genome_version: GenomeRelease,
    /// Dataset type.
    pub dataset_type: DatasetType,
    /// Schema version of the documents, 1 (legacy) or 2.
    pub schema_version: u8,
    /// Identifiers of the samples in the index.
    pub sample_ids: Vec<String>,
    /// The documents.
    pub documents: Vec<serde_json::Value>,
}

/// Physical field name of a semantic field.
pub fn physical_field(field: &Field) -> String {
    match field {
        Field::ConsequenceTerm => String::from("transcriptConsequenceTerms"),
        Field::GeneId => String::from("geneIds"),
        Field::ClinvarSignificance => String::from("clinvar_clinical_significance"),
        Field::HgmdClass => String::from("hgmd_class"),
        Field::PopulationAf(pop) => format!("{}_AF", pop),
        Field::PopulationAc(pop) => format!("{}_AC", pop),
        Field::PopulationHom(pop) => format!("{}_Hom", pop),
        Field::PopulationHemi(pop) => format!("{}_Hemi", pop),
        Field::Prediction(tool) => format!("{}_score", tool),
        Field::VariantId => String::from("variantId"),
        Field::Rsid => String::from("rsid"),
        Field::Filters => String::from("filters"),
        Field::SvType => String::from("svType"),
    }
}

fn bin_field(metric: QualityMetric, lo: i32) -> String {
    format!("samples_{}_{}_to_{}", metric, lo, lo + metric.bin_size())
}

/// Native boolean query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexQuery {
    MatchAll,
    Bool {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must: Vec<IndexQuery>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        should: Vec<IndexQuery>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must_not: Vec<IndexQuery>,
    },
    Terms {
        field: String,
        values: Vec<String>,
    },
    Range {
        field: String,
        gte: Option<f64>,
        lte: Option<f64>,
    },
    Exists {
        field: String,
    },
    Overlap {
        contig: String,
        start: i32,
        end: i32,
    },
    Named {
        name: String,
        query: Box<IndexQuery>,
    },
}

impl IndexQuery {
    fn must(must: Vec<IndexQuery>) -> Self {
        IndexQuery::Bool {
            must,
            should: vec![],
            must_not: vec![],
        }
    }

    fn should(should: Vec<IndexQuery>) -> Self {
        IndexQuery::Bool {
            must: vec![],
            should,
            must_not: vec![],
        }
    }

    fn must_not(must_not: Vec<IndexQuery>) -> Self {
        IndexQuery::Bool {
            must: vec![],
            should: vec![],
            must_not,
        }
    }

    fn term(field: &str, value: &str) -> Self {
        IndexQuery::Terms {
            field: field.to_string(),
            values: vec![value.to_string()],
        }
    }

    /// Translate a variant-level predicate.
    pub fn from_predicate(predicate: &Predicate) -> Self {
        match predicate {
            Predicate::All => IndexQuery::MatchAll,
            Predicate::Not(inner) => Self::must_not(vec![Self::from_predicate(inner)]),
            Predicate::And(preds) => Self::must(preds.iter().map(Self::from_predicate).collect()),
            Predicate::Or(preds) => Self::should(preds.iter().map(Self::from_predicate).collect()),
            Predicate::AnyOf { field, values } => IndexQuery::Terms {
                field: physical_field(field),
                values: values.clone(),
            },
            Predicate::Range { field, min, max } => IndexQuery::Range {
                field: physical_field(field),
                gte: *min,
                lte: *max,
            },
            Predicate::Missing { field } => Self::must_not(vec![IndexQuery::Exists {
                field: physical_field(field),
            }]),
            Predicate::Interval { chrom, start, end } => IndexQuery::Overlap {
                contig: chrom.clone(),
                start: *start,
                end: *end,
            },
        }
    }

    /// Translate a genotype constraint.
    pub fn from_constraint(constraint: &GenotypeConstraint) -> Self {
        match constraint {
            GenotypeConstraint::NumAlt { sample_id, allowed } => Self::should(
                allowed
                    .iter()
                    .map(|num_alt| match num_alt {
                        0 => Self::must_not(vec![
                            Self::term("samples_num_alt_1", sample_id),
                            Self::term("samples_num_alt_2", sample_id),
                            Self::term("samples_no_call", sample_id),
                        ]),
                        n => Self::term(&format!("samples_num_alt_{}", n), sample_id),
                    })
                    .collect(),
            ),
            GenotypeConstraint::Quality {
                sample_id,
                threshold,
            } => Self::must_not(
                threshold
                    .disallowed_bins()
                    .into_iter()
                    .map(|lo| Self::term(&bin_field(threshold.metric, lo), sample_id))
                    .collect(),
            ),
            GenotypeConstraint::OnChrom { chrom } => Self::term("contig", chrom),
            GenotypeConstraint::And(inner) => {
                Self::must(inner.iter().map(Self::from_constraint).collect())
            }
            GenotypeConstraint::Or(inner) => {
                Self::should(inner.iter().map(Self::from_constraint).collect())
            }
        }
    }

    /// Translate the genotype part of a request.
    pub fn from_family_filter(filter: &FamilyFilter) -> Self {
        match filter {
            FamilyFilter::Named(constraints) => Self::should(
                constraints
                    .iter()
                    .map(|named| IndexQuery::Named {
                        name: named.name.clone(),
                        query: Box::new(Self::from_constraint(&named.constraint)),
                    })
                    .collect(),
            ),
            FamilyFilter::AnyAlt { sample_families } => {
                let sample_ids: Vec<String> = sample_families.keys().cloned().collect();
                Self::should(vec![
                    IndexQuery::Terms {
                        field: String::from("samples_num_alt_1"),
                        values: sample_ids.clone(),
                    },
                    IndexQuery::Terms {
                        field: String::from("samples_num_alt_2"),
                        values: sample_ids,
                    },
                ])
            }
        }
    }

    /// Whether the document matches, collecting the names of matched named clauses.
    pub fn matches(&self, doc: &Inverted, matched: &mut Vec<String>) -> bool {
        match self {
            IndexQuery::MatchAll => true,
            IndexQuery::Bool {
                must,
                should,
                must_not,
            } => {
                if !must.iter().all(|q| q.matches(doc, matched)) {
                    return false;
                }
                let mut ignored = Vec::new();
                if must_not.iter().any(|q| q.matches(doc, &mut ignored)) {
                    return false;
                }
                if should.is_empty() {
                    return true;
                }
                let mut any = false;
                for q in should {
                    any |= q.matches(doc, matched);
                }
                any
            }
            IndexQuery::Terms { field, values } => doc
                .terms
                .get(field)
                .map_or(false, |terms| values.iter().any(|v| terms.contains(v))),
            IndexQuery::Range { field, gte, lte } => match doc.numbers.get(field) {
                Some(value) => {
                    gte.map_or(true, |gte| *value >= gte) && lte.map_or(true, |lte| *value <= lte)
                }
                None => false,
            },
            IndexQuery::Exists { field } => {
                doc.numbers.contains_key(field)
                    || doc.terms.get(field).map_or(false, |t| !t.is_empty())
            }
            IndexQuery::Overlap { contig, start, end } => {
                doc.contig == *contig && doc.start <= *end && doc.end >= *start
            }
            IndexQuery::Named { name, query } => {
                let result = query.matches(doc, matched);
                if result {
                    matched.push(name.clone());
                }
                result
            }
        }
    }
}

/// Inverted representation of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inverted {
    pub contig: String,
    pub start: i32,
    pub end: i32,
    pub xpos: i64,
    pub variant_id: String,
    pub terms: HashMap<String, HashSet<String>>,
    pub numbers: HashMap<String, f64>,
    /// Major consequence of the main transcript.
    pub main_consequence: Option<String>,
}

impl Inverted {
    fn add_term(&mut self, field: &str, value: &str) {
        self.terms
            .entry(field.to_string())
            .or_default()
            .insert(value.to_string());
    }

    fn add_genotypes(&mut self, genotypes: &[IndexGenotype], sample_ids: &[String]) {
        let mut seen = HashSet::new();
        for call in genotypes {
            seen.insert(call.sample_id.as_str());
            match call.num_alt {
                1 | 2 => self.add_term(&format!("samples_num_alt_{}", call.num_alt), &call.sample_id),
                0 => (),
                _ => self.add_term("samples_no_call", &call.sample_id),
            }
            let num_alt = u8::try_from(call.num_alt).ok();
            let values = [
                (QualityMetric::Gq, call.gq.map(f64::from)),
                (QualityMetric::Ab, call.ab.map(|ab| ab * 100.0)),
                (QualityMetric::Hl, call.hl.map(|hl| hl * 100.0)),
                (QualityMetric::Qs, call.qs.map(f64::from)),
            ];
            for (metric, value) in values {
                match value {
                    Some(value) if metric.scope().contains(num_alt) => {
                        self.add_term(&bin_field(metric, metric.bin_of(value)), &call.sample_id)
                    }
                    _ => (),
                }
            }
        }
        for sample_id in sample_ids {
            if !seen.contains(sample_id.as_str()) {
                self.add_term("samples_no_call", sample_id);
            }
        }
    }

    fn add_common(
        &mut self,
        variant_id: &str,
        contig: &str,
        start: i32,
        end: Option<i32>,
        reference: Option<&String>,
        xpos: i64,
    ) {
        let contig = canonicalize_chrom(contig);
        self.add_term("variantId", variant_id);
        self.add_term("contig", &contig);
        self.variant_id = variant_id.to_string();
        self.contig = contig;
        self.start = start;
        self.end = end.unwrap_or_else(|| start + reference.map_or(1, |r| r.len().max(1)) as i32 - 1);
        self.xpos = xpos;
    }

    /// Invert a document of the legacy schema.
    pub fn from_legacy(doc: &LegacyDocument, sample_ids: &[String]) -> Self {
        let mut result = Self::default();
        result.add_common(
            &doc.variant_id,
            &doc.contig,
            doc.start,
            doc.end,
            doc.reference.as_ref(),
            doc.xpos,
        );
        for gene_id in &doc.gene_ids {
            result.add_term("geneIds", gene_id);
        }
        for csq in doc.major_consequences.iter().flatten() {
            result.add_term("transcriptConsequenceTerms", csq);
        }
        result.main_consequence = doc.major_consequences.first().cloned().flatten();
        for (key, value) in [
            ("rsid", &doc.rsid),
            ("svType", &doc.sv_type),
            ("clinvar_clinical_significance", &doc.clinvar_clinical_significance),
            ("hgmd_class", &doc.hgmd_class),
        ] {
            if let Some(value) = value {
                result.add_term(key, value);
            }
        }
        for filter in &doc.filters {
            result.add_term("filters", filter);
        }
        for (key, value) in &doc.fields {
            match value {
                serde_json::Value::Number(n) => {
                    if let Some(n) = n.as_f64() {
                        result.numbers.insert(key.clone(), n);
                    }
                }
                serde_json::Value::String(s) => result.add_term(key, s),
                _ => (),
            }
        }
        result.add_genotypes(&doc.genotypes, sample_ids);
        result
    }

    /// Invert a document of the current schema.
    pub fn from_document(doc: &Document, sample_ids: &[String]) -> Self {
        let mut result = Self::default();
        result.add_common(
            &doc.variant_id,
            &doc.contig,
            doc.start,
            doc.end,
            doc.reference.as_ref(),
            doc.xpos,
        );
        for tx in &doc.sorted_transcript_consequences {
            result.add_term("geneIds", &tx.gene_id);
            if let Some(csq) = &tx.major_consequence {
                result.add_term("transcriptConsequenceTerms", csq);
            }
        }
        result.main_consequence = doc
            .sorted_transcript_consequences
            .first()
            .and_then(|tx| tx.major_consequence.clone());
        for (key, value) in [("rsid", &doc.rsid), ("svType", &doc.sv_type)] {
            if let Some(value) = value {
                result.add_term(key, value);
            }
        }
        if let Some(sig) = doc.clinvar.as_ref().and_then(|c| c.clinical_significance.as_ref()) {
            result.add_term("clinvar_clinical_significance", sig);
        }
        if let Some(class) = doc.hgmd.as_ref().and_then(|h| h.class.as_ref()) {
            result.add_term("hgmd_class", class);
        }
        for filter in &doc.filters {
            result.add_term("filters", filter);
        }
        for (pop, freq) in &doc.populations {
            for (field, value) in [
                (Field::PopulationAf(pop.clone()), freq.af),
                (Field::PopulationAc(pop.clone()), freq.ac.map(|v| v as f64)),
                (Field::PopulationHom(pop.clone()), freq.hom.map(|v| v as f64)),
                (Field::PopulationHemi(pop.clone()), freq.hemi.map(|v| v as f64)),
            ] {
                if let Some(value) = value {
                    result.numbers.insert(physical_field(&field), value);
                }
            }
        }
        for (tool, value) in &doc.predictions {
            let field = physical_field(&Field::Prediction(tool.clone()));
            match value {
                PredictionValue::Score(score) => {
                    result.numbers.insert(field, *score);
                }
                PredictionValue::Category(category) => result.add_term(&field, category),
            }
        }
        result.add_genotypes(&doc.genotypes, sample_ids);
        result
    }

    fn first_term(&self, field: &str) -> Option<&String> {
        self.terms.get(field).and_then(|t| t.iter().min())
    }

    /// Raw value of a sort field, before applying the direction.
    fn sort_value(
        &self,
        kind: &SortFieldKind,
        families: &[String],
        family_order: &[String],
    ) -> Option<f64> {
        match kind {
            SortFieldKind::ConsequenceRank => {
                self.main_consequence.as_deref().and_then(consequence_rank)
            }
            SortFieldKind::ClinvarRank => self
                .first_term("clinvar_clinical_significance")
                .and_then(|s| clinvar_rank(s)),
            SortFieldKind::HgmdRank => self.first_term("hgmd_class").and_then(|s| hgmd_rank(s)),
            SortFieldKind::PopulationAf(pop) => self
                .numbers
                .get(&physical_field(&Field::PopulationAf(pop.clone())))
                .copied(),
            SortFieldKind::Prediction(tool) => self
                .numbers
                .get(&physical_field(&Field::Prediction(tool.clone())))
                .copied(),
            SortFieldKind::FamilyRank => families
                .iter()
                .filter_map(|family_id| family_order.iter().position(|f| f == family_id))
                .min()
                .map(|rank| rank as f64),
        }
    }
}

/// A loaded document.
#[derive(Debug, Clone)]
enum StoredDocument {
    Legacy(LegacyDocument),
    Current(Document),
}

impl StoredDocument {
    /// Project the document to the requested samples.
    fn project(&self, sample_ids: &[String]) -> RawRow {
        let keep = |calls: &[IndexGenotype]| -> Vec<IndexGenotype> {
            calls
                .iter()
                .filter(|call| sample_ids.contains(&call.sample_id))
                .cloned()
                .collect()
        };
        match self {
            StoredDocument::Legacy(doc) => RawRow::IndexLegacy(LegacyDocument {
                genotypes: keep(&doc.genotypes),
                ..doc.clone()
            }),
            StoredDocument::Current(doc) => RawRow::Index(Document {
                genotypes: keep(&doc.genotypes),
                ..doc.clone()
            }),
        }
    }
}

/// A loaded index.
#[derive(Debug)]
struct LoadedIndex {
    info: SourceInfo,
    documents: Vec<(StoredDocument, Inverted)>,
}

impl LoadedIndex {
    fn load(source: IndexSource) -> Result<Self, anyhow::Error> {
        let mut documents = Vec::with_capacity(source.documents.len());
        for value in source.documents {
            let doc = match source.schema_version {
                1 => StoredDocument::Legacy(serde_json::from_value(value)?),
                2 => StoredDocument::Current(serde_json::from_value(value)?),
                v => anyhow::bail!("unsupported schema version {} of index {}", v, &source.name),
            };
            let inverted = match &doc {
                StoredDocument::Legacy(doc) => Inverted::from_legacy(doc, &source.sample_ids),
                StoredDocument::Current(doc) => Inverted::from_document(doc, &source.sample_ids),
            };
            documents.push((doc, inverted));
        }
        Ok(Self {
            info: SourceInfo::new(source.name, source.genome_version, source.dataset_type),
            documents,
        })
    }
}

/// Settings of the index backend.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct IndexSettings {
    /// Maximal `offset + limit` of a query.
    pub max_result_window: usize,
}

/// The inverted-index adapter.
#[derive(Debug)]
pub struct IndexAdapter {
    indices: Arc<IndexMap<String, LoadedIndex>>,
    settings: IndexSettings,
    tasks: TaskRegistry,
}

impl IndexAdapter {
    /// Construct from the indices.
    pub fn new(sources: Vec<IndexSource>, settings: IndexSettings) -> Result<Self, anyhow::Error> {
        let mut indices = IndexMap::new();
        for source in sources {
            let loaded = LoadedIndex::load(source)?;
            tracing::debug!(
                "loaded index {} with {} documents",
                &loaded.info.source_id,
                loaded.documents.len()
            );
            indices.insert(loaded.info.source_id.clone(), loaded);
        }
        Ok(Self {
            indices: Arc::new(indices),
            settings,
            tasks: TaskRegistry::default(),
        })
    }
}

/// One matching document during a scan.
struct Match {
    idx: usize,
    matched: Vec<String>,
    key: (Vec<SortValue>, i64, String),
}

async fn scan(
    indices: Arc<IndexMap<String, LoadedIndex>>,
    request: QueryRequest,
    handle: super::TaskHandle,
) -> Result<QueryResponse, SearchError> {
    let source_id = request.source_id.clone();
    let index = indices
        .get(&source_id)
        .ok_or_else(|| SearchError::Backend {
            source_id: source_id.clone(),
            message: String::from("no such index"),
        })?;

    let query = IndexQuery::must(vec![
        IndexQuery::from_predicate(&request.predicate),
        IndexQuery::from_family_filter(&request.family_filter),
    ]);
    tracing::trace!(
        "index query on {}: {}",
        &source_id,
        serde_json::to_string(&query).unwrap_or_default()
    );

    let mut matches = Vec::new();
    for (idx, (_, inverted)) in index.documents.iter().enumerate() {
        if idx % SCAN_CHUNK_SIZE == 0 {
            handle.check(&source_id)?;
            tokio::task::yield_now().await;
        }
        let mut matched = Vec::new();
        if !query.matches(inverted, &mut matched) {
            continue;
        }
        let families: Vec<String> = match &request.family_filter {
            FamilyFilter::Named(_) => matched
                .iter()
                .map(|name| family_of_constraint_name(name).to_string())
                .collect(),
            FamilyFilter::AnyAlt { sample_families } => sample_families
                .iter()
                .filter(|(sample_id, _)| {
                    ["samples_num_alt_1", "samples_num_alt_2"].iter().any(|f| {
                        inverted
                            .terms
                            .get(*f)
                            .map_or(false, |t| t.contains(*sample_id))
                    })
                })
                .map(|(_, family_id)| family_id.clone())
                .collect(),
        };
        let values = request
            .sort
            .iter()
            .map(|field| {
                field.to_ascending(inverted.sort_value(
                    &field.kind,
                    &families,
                    &request.family_order,
                ))
            })
            .collect();
        matches.push(Match {
            idx,
            matched,
            key: (values, inverted.xpos, inverted.variant_id.clone()),
        });
    }
    matches.sort_by(|a, b| a.key.cmp(&b.key));
    handle.check(&source_id)?;

    let to_hit = |m: &Match| -> Result<RawHit, SearchError> {
        Ok(RawHit {
            row: index.documents[m.idx].0.project(&request.sample_ids),
            matched_constraints: m.matched.clone(),
            sort_values: RawSortValues::Json(
                m.key
                    .0
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        })
    };

    let total = matches.len();
    match &request.mode {
        QueryMode::Plain => {
            let hits = matches
                .iter()
                .skip(request.offset)
                .take(request.limit)
                .map(to_hit)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(QueryResponse {
                source: index.info.clone(),
                hits,
                total,
                gene_buckets: vec![],
                is_gene_aggregation: false,
            })
        }
        QueryMode::GeneAggregation {
            max_per_gene,
            max_genes,
            gene_ids,
        } => {
            let mut buckets: IndexMap<String, Vec<&Match>> = IndexMap::new();
            for m in &matches {
                let inverted = &index.documents[m.idx].1;
                let mut genes: Vec<&String> = inverted
                    .terms
                    .get("geneIds")
                    .map(|g| g.iter().collect())
                    .unwrap_or_default();
                genes.sort();
                for gene_id in genes {
                    if gene_ids.as_ref().map_or(true, |ids| ids.contains(gene_id)) {
                        buckets.entry(gene_id.clone()).or_default().push(m);
                    }
                }
            }
            let gene_buckets = super::finish_buckets(buckets, *max_per_gene, *max_genes, to_hit)?;
            Ok(QueryResponse {
                source: index.info.clone(),
                hits: vec![],
                total,
                gene_buckets,
                is_gene_aggregation: true,
            })
        }
    }
}

#[async_trait::async_trait]
impl BackendQueryAdapter for IndexAdapter {
    fn name(&self) -> &str {
        "inverted-index"
    }

    fn source(&self, source_id: &str) -> Option<SourceInfo> {
        self.indices.get(source_id).map(|index| index.info.clone())
    }

    async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, SearchError> {
        check_window(request.offset, request.limit, self.settings.max_result_window)?;
        let handle = self.tasks.register(&request.source_id);
        tracing::debug!("index task {} on {}", handle.id(), &request.source_id);
        let task = tokio::spawn(scan(
            self.indices.clone(),
            request.clone(),
            handle,
        ));
        task.await.map_err(|e| SearchError::Backend {
            source_id: request.source_id.clone(),
            message: format!("task failed: {}", e),
        })?
    }

    async fn list_running(&self, min_age: Duration) -> Vec<RunningTask> {
        self.tasks.list_running(min_age)
    }

    async fn cancel(&self, ids: &[uuid::Uuid]) -> usize {
        self.tasks.cancel(ids)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::search::{
        backend::{testing::SlowAdapter, NamedConstraint},
        interpreter::quality::QualityThreshold,
        sorting::SortBy,
    };

    fn call(sample_id: &str, num_alt: i8, gq: i32) -> serde_json::Value {
        json!({"sampleId": sample_id, "numAlt": num_alt, "gq": gq})
    }

    fn doc(pos: i32, gene: &str, csq: &str, af: Option<f64>, calls: Vec<serde_json::Value>) -> serde_json::Value {
        let mut populations = serde_json::Map::new();
        if let Some(af) = af {
            populations.insert(String::from("gnomad_genomes"), json!({"af": af}));
        }
        json!({
            "variantId": format!("1-{}-A-G", pos),
            "contig": "1",
            "start": pos,
            "ref": "A",
            "alt": "G",
            "xpos": 1_000_000_000i64 + pos as i64,
            "sortedTranscriptConsequences": [
                {"transcriptId": format!("T{}", pos), "geneId": gene, "majorConsequence": csq}
            ],
            "populations": populations,
            "genotypes": calls,
        })
    }

    fn source() -> IndexSource {
        IndexSource {
            name: String::from("idx"),
            genome_version: GenomeRelease::Grch38,
            dataset_type: DatasetType::SnvIndel,
            schema_version: 2,
            sample_ids: vec![String::from("S1"), String::from("S2")],
            documents: vec![
                doc(300, "G1", "missense_variant", Some(0.001), vec![call("S1", 1, 30), call("S2", 0, 30)]),
                doc(100, "G1", "stop_gained", None, vec![call("S1", 1, 30), call("S2", 1, 30)]),
                doc(200, "G2", "missense_variant", Some(0.2), vec![call("S1", 2, 10)]),
            ],
        }
    }

    fn adapter() -> IndexAdapter {
        IndexAdapter::new(vec![source()], IndexSettings::new(10)).expect("valid source")
    }

    fn request(predicate: Predicate, family_filter: FamilyFilter) -> QueryRequest {
        QueryRequest {
            source_id: String::from("idx"),
            predicate,
            family_filter,
            mode: QueryMode::Plain,
            offset: 0,
            limit: 10,
            sort: vec![],
            family_order: vec![String::from("F1")],
            sample_ids: vec![String::from("S1")],
        }
    }

    fn any_alt() -> FamilyFilter {
        FamilyFilter::AnyAlt {
            sample_families: vec![
                (String::from("S1"), String::from("F1")),
                (String::from("S2"), String::from("F1")),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn ids(response: &QueryResponse) -> Vec<String> {
        response
            .hits
            .iter()
            .map(|hit| match &hit.row {
                RawRow::Index(doc) => doc.variant_id.clone(),
                _ => String::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_query_sorted_by_position() -> Result<(), anyhow::Error> {
        let response = adapter().execute(&request(Predicate::All, any_alt())).await?;
        assert_eq!(response.total, 3);
        assert_eq!(ids(&response), vec!["1-100-A-G", "1-200-A-G", "1-300-A-G"]);
        match &response.hits[0].row {
            RawRow::Index(doc) => assert_eq!(doc.genotypes.len(), 1),
            _ => panic!("unexpected row type"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn predicate_translation() -> Result<(), anyhow::Error> {
        let predicate = Predicate::and(vec![
            Predicate::AnyOf {
                field: Field::ConsequenceTerm,
                values: vec![String::from("missense_variant")],
            },
            Predicate::at_most_or_missing(Field::PopulationAf(String::from("gnomad_genomes")), 0.01),
        ]);
        let response = adapter().execute(&request(predicate, any_alt())).await?;
        assert_eq!(ids(&response), vec!["1-300-A-G"]);
        Ok(())
    }

    #[tokio::test]
    async fn named_constraints_are_reported() -> Result<(), anyhow::Error> {
        let filter = FamilyFilter::Named(vec![NamedConstraint::new(
            String::from("F1"),
            GenotypeConstraint::and(vec![
                GenotypeConstraint::NumAlt {
                    sample_id: String::from("S1"),
                    allowed: vec![1],
                },
                GenotypeConstraint::NumAlt {
                    sample_id: String::from("S2"),
                    allowed: vec![0],
                },
                GenotypeConstraint::Quality {
                    sample_id: String::from("S1"),
                    threshold: QualityThreshold::new(QualityMetric::Gq, 20),
                },
            ]),
        )]);
        let response = adapter().execute(&request(Predicate::All, filter)).await?;
        assert_eq!(ids(&response), vec!["1-300-A-G"]);
        assert_eq!(response.hits[0].matched_constraints, vec![String::from("F1")]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_sample_is_no_call() -> Result<(), anyhow::Error> {
        let filter = FamilyFilter::Named(vec![NamedConstraint::new(
            String::from("F1"),
            GenotypeConstraint::NumAlt {
                sample_id: String::from("S2"),
                allowed: vec![0],
            },
        )]);
        let response = adapter().execute(&request(Predicate::All, filter)).await?;
        assert_eq!(ids(&response), vec!["1-300-A-G"]);
        Ok(())
    }

    #[tokio::test]
    async fn sort_with_missing_values_last() -> Result<(), anyhow::Error> {
        let mut req = request(Predicate::All, any_alt());
        req.sort = SortBy::Gnomad.fields();
        let response = adapter().execute(&req).await?;
        assert_eq!(ids(&response), vec!["1-300-A-G", "1-200-A-G", "1-100-A-G"]);
        assert_eq!(
            response.hits[2].sort_values,
            RawSortValues::Json(vec![json!("Infinity")])
        );
        Ok(())
    }

    #[tokio::test]
    async fn window_too_large() {
        let mut req = request(Predicate::All, any_alt());
        req.offset = 5;
        let result = adapter().execute(&req).await;
        assert!(matches!(result, Err(SearchError::TooManyResults { .. })));
    }

    #[tokio::test]
    async fn gene_aggregation() -> Result<(), anyhow::Error> {
        let mut req = request(Predicate::All, any_alt());
        req.mode = QueryMode::GeneAggregation {
            max_per_gene: 10,
            max_genes: 10,
            gene_ids: None,
        };
        let response = adapter().execute(&req).await?;
        assert!(response.is_gene_aggregation);
        let genes: Vec<(&str, usize)> = response
            .gene_buckets
            .iter()
            .map(|bucket| (bucket.gene_id.as_str(), bucket.hits.len()))
            .collect();
        assert_eq!(genes, vec![("G1", 2), ("G2", 1)]);

        req.mode = QueryMode::GeneAggregation {
            max_per_gene: 10,
            max_genes: 0,
            gene_ids: None,
        };
        let result = adapter().execute(&req).await;
        assert!(matches!(result, Err(SearchError::TooManyGenes { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn legacy_schema() -> Result<(), anyhow::Error> {
        let source = IndexSource {
            name: String::from("legacy"),
            genome_version: GenomeRelease::Grch37,
            dataset_type: DatasetType::SnvIndel,
            schema_version: 1,
            sample_ids: vec![String::from("S1")],
            documents: vec![json!({
                "variantId": "1-100-A-G",
                "contig": "chr1",
                "start": 100,
                "ref": "A",
                "alt": "G",
                "xpos": 1_000_000_100i64,
                "transcriptIds": ["T1", "T2"],
                "geneIds": ["G1", "G1"],
                "majorConsequences": ["intron_variant", "missense_variant"],
                "fields": {"gnomad_genomes_AF": 0.5, "cadd_score": 20.0},
                "genotypes": [{"sampleId": "S1", "numAlt": 1}],
            })],
        };
        let adapter = IndexAdapter::new(vec![source], IndexSettings::new(10))?;
        let mut req = request(
            Predicate::and(vec![
                Predicate::AnyOf {
                    field: Field::ConsequenceTerm,
                    values: vec![String::from("missense_variant")],
                },
                Predicate::Range {
                    field: Field::PopulationAf(String::from("gnomad_genomes")),
                    min: Some(0.1),
                    max: None,
                },
            ]),
            any_alt(),
        );
        req.source_id = String::from("legacy");
        let response = adapter.execute(&req).await?;
        assert_eq!(response.total, 1);
        assert!(matches!(response.hits[0].row, RawRow::IndexLegacy(_)));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation() -> Result<(), anyhow::Error> {
        let inner: Arc<dyn BackendQueryAdapter> =
            Arc::new(IndexAdapter::new(vec![source()], IndexSettings::new(10))?);
        let adapter = Arc::new(SlowAdapter::new(inner, Duration::from_secs(30)));
        let req = request(Predicate::All, any_alt());
        let running = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.execute(&req).await })
        };
        let mut tasks = Vec::new();
        for _ in 0..100 {
            tasks = adapter.list_running(Duration::ZERO).await;
            if !tasks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tasks.len(), 1);
        let ids: Vec<uuid::Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(adapter.cancel(&ids).await, 1);
        let result = running.await?;
        assert!(matches!(result, Err(SearchError::Backend { .. })));
        Ok(())
    }

    #[test]
    fn query_json_shape() -> Result<(), anyhow::Error> {
        let query = IndexQuery::from_predicate(&Predicate::Missing {
            field: Field::Filters,
        });
        assert_eq!(
            serde_json::to_value(&query)?,
            json!({"bool": {"must_not": [{"exists": {"field": "filters"}}]}})
        );
        Ok(())
    }
}
