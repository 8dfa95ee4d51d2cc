//! Merge records of the same biological variant from several data sources and builds.
//!
//! Two records describe the same variant if they have the same build and variant id, or
//! if the lifted-over coordinates of one equal the native coordinates of the other.  The
//! identities are resolved with two indices (variant id and native coordinates) built in
//! a first pass, so the outcome does not depend on the order of the input.

use std::collections::HashMap;

use crate::{common::GenomeRelease, search::schema::VariantRecord};

/// Native coordinates of a record, including the alleles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CoordKey {
    genome_version: GenomeRelease,
    chrom: String,
    pos: i32,
    reference: Option<String>,
    alternative: Option<String>,
    sv_type: Option<String>,
}

impl CoordKey {
    fn native(record: &VariantRecord) -> Self {
        Self {
            genome_version: record.genome_version,
            chrom: record.chrom.clone(),
            pos: record.pos,
            reference: record.reference.clone(),
            alternative: record.alternative.clone(),
            sv_type: record.sv_type.clone(),
        }
    }

    fn lifted(record: &VariantRecord) -> Option<Self> {
        record.lifted_over.as_ref().map(|lifted| Self {
            genome_version: lifted.genome_version,
            chrom: lifted.chrom.clone(),
            pos: lifted.pos,
            reference: record.reference.clone(),
            alternative: record.alternative.clone(),
            sv_type: record.sv_type.clone(),
        })
    }
}

/// Whether the two records describe the same variant.
pub fn is_same_variant(a: &VariantRecord, b: &VariantRecord) -> bool {
    if a.genome_version == b.genome_version {
        a.variant_id == b.variant_id
    } else {
        CoordKey::lifted(a).as_ref() == Some(&CoordKey::native(b))
            || CoordKey::lifted(b).as_ref() == Some(&CoordKey::native(a))
    }
}

/// Merge the duplicate `from` into `into`.
///
/// Family ids are united (sorted, de-duplicated), genotypes are united with `from`
/// winning for the same individual.
pub fn merge_duplicate(into: &mut VariantRecord, from: VariantRecord) {
    into.family_ids.extend(from.family_ids);
    into.family_ids.sort();
    into.family_ids.dedup();
    into.genotypes.extend(from.genotypes);
    into.genotypes.sort_keys();
}

/// Running counters of the deduplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupCounters {
    /// Total number of results, decremented on every merge.
    pub total: usize,
    /// Number of merges.
    pub duplicates: usize,
}

impl DedupCounters {
    fn count_merge(&mut self) {
        self.total = self.total.saturating_sub(1);
        self.duplicates += 1;
    }
}

/// Disjoint set over record positions.
struct Clusters {
    parent: Vec<usize>,
}

impl Clusters {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, idx: usize) -> usize {
        let mut root = idx;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut idx = idx;
        while self.parent[idx] != root {
            let next = self.parent[idx];
            self.parent[idx] = root;
            idx = next;
        }
        root
    }

    /// Union, the smaller position becomes the root.
    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a != b {
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            self.parent[hi] = lo;
        }
    }
}

/// De-duplicate the sorted `records`.
///
/// Each group of duplicates is merged into its record in `search_build` (the first one
/// if there is none).  The merged record keeps the sort key of that record and the
/// result is sorted again.
pub fn deduplicate(
    records: Vec<VariantRecord>,
    search_build: GenomeRelease,
    counters: &mut DedupCounters,
) -> Vec<VariantRecord> {
    let mut by_id: HashMap<(GenomeRelease, &str), usize> = HashMap::new();
    let mut by_native: HashMap<CoordKey, usize> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        by_id
            .entry((record.genome_version, record.variant_id.as_str()))
            .or_insert(idx);
        by_native.entry(CoordKey::native(record)).or_insert(idx);
    }

    let mut clusters = Clusters::new(records.len());
    for (idx, record) in records.iter().enumerate() {
        if let Some(other) = by_id.get(&(record.genome_version, record.variant_id.as_str())) {
            clusters.union(idx, *other);
        }
        if let Some(other) = CoordKey::lifted(record).and_then(|key| by_native.get(&key)) {
            clusters.union(idx, *other);
        }
    }

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    for idx in 0..records.len() {
        let root = clusters.find(idx);
        members[root].push(idx);
    }

    let mut slots: Vec<Option<VariantRecord>> = records.into_iter().map(Some).collect();
    let mut result = Vec::new();
    for group in members.into_iter().filter(|group| !group.is_empty()) {
        let lead = group
            .iter()
            .copied()
            .find(|idx| {
                slots[*idx]
                    .as_ref()
                    .map_or(false, |r| r.genome_version == search_build)
            })
            .unwrap_or(group[0]);
        let Some(mut merged) = slots[lead].take() else {
            continue;
        };
        for idx in group {
            if let Some(duplicate) = slots[idx].take() {
                tracing::trace!(
                    "merging duplicate {} ({}) into {} ({})",
                    &duplicate.variant_id,
                    duplicate.genome_version,
                    &merged.variant_id,
                    merged.genome_version
                );
                merge_duplicate(&mut merged, duplicate);
                counters.count_merge();
            }
        }
        result.push(merged);
    }
    result.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
    result
}

/// Merge `record` into its duplicate among `existing`, returning it if there is none.
pub fn merge_into_existing<'a, I>(
    existing: I,
    record: VariantRecord,
    counters: &mut DedupCounters,
) -> Option<VariantRecord>
where
    I: IntoIterator<Item = &'a mut VariantRecord>,
{
    for candidate in existing {
        if is_same_variant(candidate, &record) {
            merge_duplicate(candidate, record);
            counters.count_merge();
            return None;
        }
    }
    Some(record)
}
