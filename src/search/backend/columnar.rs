//! Columnar table backend.
//!
//! A table holds one row per variant.  On loading, the annotation fields are split into
//! term and numeric columns, and the calls into one `num_alt` and one column per quality
//! metric, each indexed by row and sample position.  Queries are compiled into an
//! expression over column names and sample positions, columns absent from the table are
//! resolved at compile time.  Sort keys are returned as order-preserving `u64` values.

use std::{collections::HashMap, sync::Arc, time::Duration};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    common::{canonicalize_chrom, GenomeRelease},
    err::SearchError,
    search::{
        backend::{
            check_window, finish_buckets, BackendQueryAdapter, FamilyFilter,
            QueryMode, QueryRequest, QueryResponse, RawHit, RawRow, RawSortValues, RunningTask,
            SourceInfo, TaskHandle, TaskRegistry, SCAN_CHUNK_SIZE,
        },
        interpreter::{
            consequences::consequence_rank,
            genotype::{family_of_constraint_name, GenotypeConstraint},
            quality::{QualityMetric, QualityThreshold},
            Field, Predicate,
        },
        schema::{
            ClinvarInfo, DatasetType, HgmdInfo, PopulationFrequency, PredictionValue,
            TranscriptConsequence,
        },
        sorting::{clinvar_rank, encode_unsigned, hgmd_rank, SortFieldKind},
    },
};

/// Call of one sample in a table row.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnarCall {
    pub sample_id: String,
    /// Number of alternate alleles, absent for no-call.
    pub num_alt: Option<u8>,
    pub gq: Option<i32>,
    /// Allele balance in `[0, 1]`.
    pub ab: Option<f64>,
    pub dp: Option<i32>,
    pub cn: Option<i32>,
    /// Heteroplasmy level in `[0, 1]`.
    pub hl: Option<f64>,
    pub qs: Option<i32>,
}

impl ColumnarCall {
    fn quality(&self, metric: QualityMetric) -> Option<f64> {
        match metric {
            QualityMetric::Gq => self.gq.map(f64::from),
            QualityMetric::Ab => self.ab.map(|ab| ab * 100.0),
            QualityMetric::Hl => self.hl.map(|hl| hl * 100.0),
            QualityMetric::Qs => self.qs.map(f64::from),
        }
    }
}

/// One table row.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub variant_id: String,
    pub chrom: String,
    pub pos: i32,
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
    /// Transcript consequences, the main transcript first.
    #[serde(default)]
    pub transcripts: Vec<TranscriptConsequence>,
    pub clinvar: Option<ClinvarInfo>,
    pub hgmd: Option<HgmdInfo>,
    #[serde(default)]
    pub populations: IndexMap<String, PopulationFrequency>,
    #[serde(default)]
    pub predictions: IndexMap<String, PredictionValue>,
    #[serde(default)]
    pub calls: Vec<ColumnarCall>,
}

/// One table as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSource {
    pub name: String,
    pub genome_version: GenomeRelease,
    pub dataset_type: DatasetType,
    /// Samples of the table, in column order.
    pub sample_ids: Vec<String>,
    pub rows: Vec<Row>,
}

/// Column name of a semantic field.
pub fn column_name(field: &Field) -> String {
    match field {
        Field::ConsequenceTerm => String::from("consequence_terms"),
        Field::GeneId => String::from("gene_ids"),
        Field::ClinvarSignificance => String::from("clinvar.significance"),
        Field::HgmdClass => String::from("hgmd.class"),
        Field::PopulationAf(pop) => format!("{}.af", pop),
        Field::PopulationAc(pop) => format!("{}.ac", pop),
        Field::PopulationHom(pop) => format!("{}.hom", pop),
        Field::PopulationHemi(pop) => format!("{}.hemi", pop),
        Field::Prediction(tool) => format!("predictions.{}", tool),
        Field::VariantId => String::from("variant_id"),
        Field::Rsid => String::from("rsid"),
        Field::Filters => String::from("filters"),
        Field::SvType => String::from("sv_type"),
    }
}

/// Expression compiled against one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(bool),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Terms {
        column: String,
        values: Vec<String>,
    },
    Range {
        column: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    IsNull {
        column: String,
    },
    Overlaps {
        chrom: String,
        start: i32,
        end: i32,
    },
    NumAlt {
        sample: usize,
        allowed: Vec<u8>,
    },
    QualityAtLeast {
        sample: usize,
        threshold: QualityThreshold,
    },
    ChromIs(String),
    Named {
        name: String,
        expr: Box<Expr>,
    },
}

/// A loaded table.
#[derive(Debug)]
struct Table {
    info: SourceInfo,
    sample_index: IndexMap<String, usize>,
    rows: Vec<Row>,
    term_columns: HashMap<String, Vec<Vec<String>>>,
    numeric_columns: HashMap<String, Vec<Option<f64>>>,
    chrom: Vec<String>,
    start: Vec<i32>,
    end: Vec<i32>,
    /// `[row][sample]`
    num_alt: Vec<Vec<Option<u8>>>,
    /// `[row][sample]` per metric
    quality: HashMap<QualityMetric, Vec<Vec<Option<f64>>>>,
}

impl Table {
    fn load(source: TableSource) -> Self {
        let sample_index: IndexMap<String, usize> = source
            .sample_ids
            .iter()
            .enumerate()
            .map(|(idx, sample_id)| (sample_id.clone(), idx))
            .collect();
        let row_count = source.rows.len();
        let mut term_columns: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        let mut numeric_columns: HashMap<String, Vec<Option<f64>>> = HashMap::new();
        let mut push_terms = |column: String, idx: usize, values: Vec<String>| {
            if !values.is_empty() {
                term_columns
                    .entry(column)
                    .or_insert_with(|| vec![Vec::new(); row_count])[idx] = values;
            }
        };
        let mut push_number = |column: String, idx: usize, value: Option<f64>| {
            if value.is_some() {
                numeric_columns
                    .entry(column)
                    .or_insert_with(|| vec![None; row_count])[idx] = value;
            }
        };

        let mut chrom = Vec::with_capacity(row_count);
        let mut start = Vec::with_capacity(row_count);
        let mut end = Vec::with_capacity(row_count);
        let mut num_alt = Vec::with_capacity(row_count);
        let mut quality: HashMap<QualityMetric, Vec<Vec<Option<f64>>>> = HashMap::new();
        let metrics = [
            QualityMetric::Gq,
            QualityMetric::Ab,
            QualityMetric::Hl,
            QualityMetric::Qs,
        ];

        for (idx, row) in source.rows.iter().enumerate() {
            chrom.push(canonicalize_chrom(&row.chrom));
            start.push(row.pos);
            end.push(row.end.unwrap_or_else(|| {
                row.pos + row.reference.as_ref().map_or(1, |r| r.len().max(1)) as i32 - 1
            }));

            let mut gene_ids: Vec<String> = Vec::new();
            for tx in &row.transcripts {
                if !gene_ids.contains(&tx.gene_id) {
                    gene_ids.push(tx.gene_id.clone());
                }
            }
            push_terms(column_name(&Field::GeneId), idx, gene_ids);
            push_terms(
                column_name(&Field::ConsequenceTerm),
                idx,
                row.transcripts
                    .iter()
                    .filter_map(|tx| tx.major_consequence.clone())
                    .collect(),
            );
            push_terms(
                column_name(&Field::ClinvarSignificance),
                idx,
                row.clinvar
                    .as_ref()
                    .and_then(|c| c.clinical_significance.clone())
                    .into_iter()
                    .collect(),
            );
            push_terms(
                column_name(&Field::HgmdClass),
                idx,
                row.hgmd
                    .as_ref()
                    .and_then(|h| h.class.clone())
                    .into_iter()
                    .collect(),
            );
            push_terms(column_name(&Field::VariantId), idx, vec![row.variant_id.clone()]);
            push_terms(column_name(&Field::Rsid), idx, row.rsid.iter().cloned().collect());
            push_terms(column_name(&Field::SvType), idx, row.sv_type.iter().cloned().collect());
            push_terms(column_name(&Field::Filters), idx, row.filters.clone());

            for (pop, freq) in &row.populations {
                push_number(column_name(&Field::PopulationAf(pop.clone())), idx, freq.af);
                push_number(
                    column_name(&Field::PopulationAc(pop.clone())),
                    idx,
                    freq.ac.map(|v| v as f64),
                );
                push_number(
                    column_name(&Field::PopulationHom(pop.clone())),
                    idx,
                    freq.hom.map(|v| v as f64),
                );
                push_number(
                    column_name(&Field::PopulationHemi(pop.clone())),
                    idx,
                    freq.hemi.map(|v| v as f64),
                );
            }
            for (tool, value) in &row.predictions {
                let column = column_name(&Field::Prediction(tool.clone()));
                match value {
                    PredictionValue::Score(score) => push_number(column, idx, Some(*score)),
                    PredictionValue::Category(category) => {
                        push_terms(column, idx, vec![category.clone()])
                    }
                }
            }

            let mut row_num_alt = vec![None; sample_index.len()];
            let mut row_quality: HashMap<QualityMetric, Vec<Option<f64>>> = metrics
                .iter()
                .map(|metric| (*metric, vec![None; sample_index.len()]))
                .collect();
            for call in &row.calls {
                if let Some(sample) = sample_index.get(&call.sample_id) {
                    row_num_alt[*sample] = call.num_alt;
                    for metric in metrics {
                        if let Some(column) = row_quality.get_mut(&metric) {
                            column[*sample] = call.quality(metric);
                        }
                    }
                }
            }
            num_alt.push(row_num_alt);
            for (metric, values) in row_quality {
                quality.entry(metric).or_default().push(values);
            }
        }

        Self {
            info: SourceInfo::new(source.name, source.genome_version, source.dataset_type),
            sample_index,
            rows: source.rows,
            term_columns,
            numeric_columns,
            chrom,
            start,
            end,
            num_alt,
            quality,
        }
    }

    /// Compile a variant-level predicate.
    fn compile_predicate(&self, predicate: &Predicate) -> Expr {
        match predicate {
            Predicate::All => Expr::Const(true),
            Predicate::Not(inner) => Expr::Not(Box::new(self.compile_predicate(inner))),
            Predicate::And(preds) => {
                Expr::And(preds.iter().map(|p| self.compile_predicate(p)).collect())
            }
            Predicate::Or(preds) => {
                Expr::Or(preds.iter().map(|p| self.compile_predicate(p)).collect())
            }
            Predicate::AnyOf { field, values } => {
                let column = column_name(field);
                if self.term_columns.contains_key(&column) {
                    Expr::Terms {
                        column,
                        values: values.clone(),
                    }
                } else {
                    Expr::Const(false)
                }
            }
            Predicate::Range { field, min, max } => {
                let column = column_name(field);
                if self.numeric_columns.contains_key(&column) {
                    Expr::Range {
                        column,
                        min: *min,
                        max: *max,
                    }
                } else {
                    Expr::Const(false)
                }
            }
            Predicate::Missing { field } => {
                let column = column_name(field);
                if self.numeric_columns.contains_key(&column)
                    || self.term_columns.contains_key(&column)
                {
                    Expr::IsNull { column }
                } else {
                    Expr::Const(true)
                }
            }
            Predicate::Interval { chrom, start, end } => Expr::Overlaps {
                chrom: chrom.clone(),
                start: *start,
                end: *end,
            },
        }
    }

    /// Compile a genotype constraint, resolving sample ids to column positions.
    fn compile_constraint(&self, constraint: &GenotypeConstraint) -> Expr {
        match constraint {
            GenotypeConstraint::NumAlt { sample_id, allowed } => {
                match self.sample_index.get(sample_id) {
                    Some(sample) => Expr::NumAlt {
                        sample: *sample,
                        allowed: allowed.clone(),
                    },
                    None => Expr::Const(false),
                }
            }
            GenotypeConstraint::Quality {
                sample_id,
                threshold,
            } => match self.sample_index.get(sample_id) {
                Some(sample) => Expr::QualityAtLeast {
                    sample: *sample,
                    threshold: *threshold,
                },
                None => Expr::Const(true),
            },
            GenotypeConstraint::OnChrom { chrom } => Expr::ChromIs(chrom.clone()),
            GenotypeConstraint::And(inner) => {
                Expr::And(inner.iter().map(|c| self.compile_constraint(c)).collect())
            }
            GenotypeConstraint::Or(inner) => {
                Expr::Or(inner.iter().map(|c| self.compile_constraint(c)).collect())
            }
        }
    }

    fn compile_family_filter(&self, filter: &FamilyFilter) -> Expr {
        match filter {
            FamilyFilter::Named(constraints) => Expr::Or(
                constraints
                    .iter()
                    .map(|named| Expr::Named {
                        name: named.name.clone(),
                        expr: Box::new(self.compile_constraint(&named.constraint)),
                    })
                    .collect(),
            ),
            FamilyFilter::AnyAlt { sample_families } => Expr::Or(
                sample_families
                    .keys()
                    .filter_map(|sample_id| self.sample_index.get(sample_id))
                    .map(|sample| Expr::NumAlt {
                        sample: *sample,
                        allowed: vec![1, 2],
                    })
                    .collect(),
            ),
        }
    }

    /// Evaluate on row `idx`, collecting matched names.
    fn eval(&self, expr: &Expr, idx: usize, matched: &mut Vec<String>) -> bool {
        match expr {
            Expr::Const(value) => *value,
            Expr::Not(inner) => !self.eval(inner, idx, &mut Vec::new()),
            Expr::And(inner) => inner.iter().all(|e| self.eval(e, idx, matched)),
            Expr::Or(inner) => {
                let mut any = false;
                for e in inner {
                    any |= self.eval(e, idx, matched);
                }
                any
            }
            Expr::Terms { column, values } => self
                .term_columns
                .get(column)
                .map_or(false, |col| col[idx].iter().any(|v| values.contains(v))),
            Expr::Range { column, min, max } => {
                match self.numeric_columns.get(column).and_then(|col| col[idx]) {
                    Some(value) => {
                        min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
                    }
                    None => false,
                }
            }
            Expr::IsNull { column } => {
                let number = self.numeric_columns.get(column).and_then(|col| col[idx]);
                let terms = self
                    .term_columns
                    .get(column)
                    .map_or(true, |col| col[idx].is_empty());
                number.is_none() && terms
            }
            Expr::Overlaps { chrom, start, end } => {
                self.chrom[idx] == *chrom && self.start[idx] <= *end && self.end[idx] >= *start
            }
            Expr::NumAlt { sample, allowed } => self.num_alt[idx][*sample]
                .map_or(false, |num_alt| allowed.contains(&num_alt)),
            Expr::QualityAtLeast { sample, threshold } => {
                let metric = threshold.metric;
                if !metric.scope().contains(self.num_alt[idx][*sample]) {
                    return true;
                }
                match self.quality.get(&metric).and_then(|col| col[idx][*sample]) {
                    Some(value) => metric.bin_of(value) >= threshold.min,
                    None => true,
                }
            }
            Expr::ChromIs(chrom) => self.chrom[idx] == *chrom,
            Expr::Named { name, expr } => {
                let result = self.eval(expr, idx, matched);
                if result {
                    matched.push(name.clone());
                }
                result
            }
        }
    }

    fn sort_value(
        &self,
        idx: usize,
        kind: &SortFieldKind,
        families: &[String],
        family_order: &[String],
    ) -> Option<f64> {
        let row = &self.rows[idx];
        match kind {
            SortFieldKind::ConsequenceRank => row
                .transcripts
                .first()
                .and_then(|tx| tx.major_consequence.as_deref())
                .and_then(consequence_rank),
            SortFieldKind::ClinvarRank => row
                .clinvar
                .as_ref()
                .and_then(|c| c.clinical_significance.as_deref())
                .and_then(clinvar_rank),
            SortFieldKind::HgmdRank => row
                .hgmd
                .as_ref()
                .and_then(|h| h.class.as_deref())
                .and_then(hgmd_rank),
            SortFieldKind::PopulationAf(pop) => self
                .numeric_columns
                .get(&column_name(&Field::PopulationAf(pop.clone())))
                .and_then(|col| col[idx]),
            SortFieldKind::Prediction(tool) => self
                .numeric_columns
                .get(&column_name(&Field::Prediction(tool.clone())))
                .and_then(|col| col[idx]),
            SortFieldKind::FamilyRank => families
                .iter()
                .filter_map(|family_id| family_order.iter().position(|f| f == family_id))
                .min()
                .map(|rank| rank as f64),
        }
    }

    /// The row restricted to the calls of the requested samples.
    fn project(&self, idx: usize, sample_ids: &[String]) -> Row {
        let row = &self.rows[idx];
        Row {
            calls: row
                .calls
                .iter()
                .filter(|call| sample_ids.contains(&call.sample_id))
                .cloned()
                .collect(),
            ..row.clone()
        }
    }
}

/// Settings of the columnar backend.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct ColumnarSettings {
    /// Maximal `offset + limit` of a query.
    pub max_result_window: usize,
}

/// The columnar table adapter.
#[derive(Debug)]
pub struct ColumnarAdapter {
    tables: Arc<IndexMap<String, Table>>,
    settings: ColumnarSettings,
    tasks: TaskRegistry,
}

impl ColumnarAdapter {
    /// Construct from the tables.
    pub fn new(sources: Vec<TableSource>, settings: ColumnarSettings) -> Self {
        let tables = sources
            .into_iter()
            .map(|source| {
                let table = Table::load(source);
                tracing::debug!(
                    "loaded table {} with {} rows",
                    &table.info.source_id,
                    table.rows.len()
                );
                (table.info.source_id.clone(), table)
            })
            .collect();
        Self {
            tables: Arc::new(tables),
            settings,
            tasks: TaskRegistry::default(),
        }
    }
}

/// One matching row during a scan.
struct Match {
    idx: usize,
    matched: Vec<String>,
    values: Vec<u64>,
    xpos: i64,
}

async fn scan(
    tables: Arc<IndexMap<String, Table>>,
    request: QueryRequest,
    handle: TaskHandle,
) -> Result<QueryResponse, SearchError> {
    let source_id = request.source_id.clone();
    let table = tables.get(&source_id).ok_or_else(|| SearchError::Backend {
        source_id: source_id.clone(),
        message: String::from("no such table"),
    })?;

    let expr = Expr::And(vec![
        table.compile_predicate(&request.predicate),
        table.compile_family_filter(&request.family_filter),
    ]);
    tracing::trace!("columnar expression on {}: {:?}", &source_id, &expr);

    let mut matches = Vec::new();
    for idx in 0..table.rows.len() {
        if idx % SCAN_CHUNK_SIZE == 0 {
            handle.check(&source_id)?;
            tokio::task::yield_now().await;
        }
        let mut matched = Vec::new();
        if !table.eval(&expr, idx, &mut matched) {
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
                    table
                        .sample_index
                        .get(*sample_id)
                        .and_then(|sample| table.num_alt[idx][*sample])
                        .map_or(false, |num_alt| num_alt > 0)
                })
                .map(|(_, family_id)| family_id.clone())
                .collect(),
        };
        let values = request
            .sort
            .iter()
            .map(|field| {
                let value = field.to_ascending(table.sort_value(
                    idx,
                    &field.kind,
                    &families,
                    &request.family_order,
                ));
                encode_unsigned(value.0)
            })
            .collect();
        matches.push(Match {
            idx,
            matched,
            values,
            xpos: table.rows[idx].xpos,
        });
    }
    matches.sort_by(|a, b| {
        (&a.values, a.xpos, &table.rows[a.idx].variant_id).cmp(&(
            &b.values,
            b.xpos,
            &table.rows[b.idx].variant_id,
        ))
    });
    handle.check(&source_id)?;

    let to_hit = |m: &Match| -> Result<RawHit, SearchError> {
        Ok(RawHit {
            row: RawRow::Columnar(table.project(m.idx, &request.sample_ids)),
            matched_constraints: m.matched.clone(),
            sort_values: RawSortValues::Unsigned(m.values.clone()),
        })
    };

    let total = matches.len();
    match &request.mode {
        QueryMode::Plain => Ok(QueryResponse {
            source: table.info.clone(),
            hits: matches
                .iter()
                .skip(request.offset)
                .take(request.limit)
                .map(to_hit)
                .collect::<Result<Vec<_>, _>>()?,
            total,
            gene_buckets: vec![],
            is_gene_aggregation: false,
        }),
        QueryMode::GeneAggregation {
            max_per_gene,
            max_genes,
            gene_ids,
        } => {
            let mut buckets: IndexMap<String, Vec<&Match>> = IndexMap::new();
            let gene_column = table.term_columns.get(&column_name(&Field::GeneId));
            for m in &matches {
                let mut genes: Vec<&String> = gene_column
                    .map(|col| col[m.idx].iter().collect())
                    .unwrap_or_default();
                genes.sort();
                for gene_id in genes {
                    if gene_ids.as_ref().map_or(true, |ids| ids.contains(gene_id)) {
                        buckets.entry(gene_id.clone()).or_default().push(m);
                    }
                }
            }
            Ok(QueryResponse {
                source: table.info.clone(),
                hits: vec![],
                total,
                gene_buckets: finish_buckets(buckets, *max_per_gene, *max_genes, to_hit)?,
                is_gene_aggregation: true,
            })
        }
    }
}

#[async_trait::async_trait]
impl BackendQueryAdapter for ColumnarAdapter {
    fn name(&self) -> &str {
        "columnar"
    }

    fn source(&self, source_id: &str) -> Option<SourceInfo> {
        self.tables.get(source_id).map(|table| table.info.clone())
    }

    async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, SearchError> {
        check_window(request.offset, request.limit, self.settings.max_result_window)?;
        let handle = self.tasks.register(&request.source_id);
        tracing::debug!("columnar task {} on {}", handle.id(), &request.source_id);
        tokio::spawn(scan(
            self.tables.clone(),
            request.clone(),
            handle,
        ))
        .await
        .map_err(|e| SearchError::Backend {
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
