//! Coordinate mapping between the genome builds.
//!
//! The engine only needs point lookups.  `ChainMapper` answers them from ungapped chain
//! blocks and `CachedMapper` memoizes the answers of any mapper.

use std::{
    collections::HashMap,
    io::Read,
    path::Path,
    sync::{Arc, Mutex},
    time::Instant,
};

use indexmap::IndexMap;

use crate::{
    common::{canonicalize_chrom, GenomeRelease},
    search::schema::LiftedCoordinates,
};

/// Maps a 1-based position from one genome build to the other one.
pub trait CoordinateMapper: Send + Sync {
    /// Map the position, `None` if there is no mapping.
    fn map(&self, release: GenomeRelease, chrom: &str, pos: i32) -> Option<LiftedCoordinates>;
}

impl<M: CoordinateMapper + ?Sized> CoordinateMapper for Arc<M> {
    fn map(&self, release: GenomeRelease, chrom: &str, pos: i32) -> Option<LiftedCoordinates> {
        (**self).map(release, chrom, pos)
    }
}

/// Module with code supporting the parsing.
mod input {
    use serde::Deserialize;

    use crate::common::GenomeRelease;

    /// One ungapped, forward-strand chain block.
    #[derive(Debug, Deserialize)]
    pub struct Record {
        /// Build of the source coordinates.
        pub source_release: GenomeRelease,
        /// Source chromosome.
        pub source_chrom: String,
        /// 1-based source start position.
        pub source_start: i32,
        /// Target chromosome.
        pub target_chrom: String,
        /// 1-based target start position.
        pub target_start: i32,
        /// Length of the block.
        pub length: i32,
    }
}

/// One block of the chain in memory.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct ChainBlock {
    /// 1-based source start position.
    pub source_start: i32,
    /// Target chromosome.
    pub target_chrom: String,
    /// 1-based target start position.
    pub target_start: i32,
    /// Length of the block.
    pub length: i32,
}

/// Mapper based on ungapped chain blocks.
#[derive(Debug, Clone, Default)]
pub struct ChainMapper {
    /// Blocks by source release and chromosome, sorted by start position.
    blocks: IndexMap<(GenomeRelease, String), Vec<ChainBlock>>,
}

impl ChainMapper {
    /// Add a block, the chromosomes are canonicalized.
    pub fn add_block(&mut self, release: GenomeRelease, source_chrom: &str, block: ChainBlock) {
        let block = ChainBlock {
            target_chrom: canonicalize_chrom(&block.target_chrom),
            ..block
        };
        let blocks = self
            .blocks
            .entry((release, canonicalize_chrom(source_chrom)))
            .or_default();
        let idx = blocks.partition_point(|b| b.source_start < block.source_start);
        blocks.insert(idx, block);
    }

    /// Load from a TSV file with header.
    #[tracing::instrument]
    pub fn from_path(path: &Path) -> Result<Self, anyhow::Error> {
        tracing::debug!("loading liftover chain blocks from {:?}...", path);
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Load from TSV with header.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, anyhow::Error> {
        let before_loading = Instant::now();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .comment(Some(b'#'))
            .from_reader(reader);

        let mut result = Self::default();
        let mut total_count = 0;
        for record in reader.deserialize() {
            let record: input::Record = record?;
            result.add_block(
                record.source_release,
                &record.source_chrom,
                ChainBlock::new(
                    record.source_start,
                    record.target_chrom,
                    record.target_start,
                    record.length,
                ),
            );
            total_count += 1;
        }
        tracing::debug!(
            "... done loading {} chain blocks in {:?}",
            total_count,
            before_loading.elapsed()
        );
        Ok(result)
    }
}

impl CoordinateMapper for ChainMapper {
    fn map(&self, release: GenomeRelease, chrom: &str, pos: i32) -> Option<LiftedCoordinates> {
        let blocks = self.blocks.get(&(release, canonicalize_chrom(chrom)))?;
        let idx = blocks.partition_point(|b| b.source_start <= pos);
        let block = blocks.get(idx.checked_sub(1)?)?;
        if pos < block.source_start + block.length {
            Some(LiftedCoordinates::new(
                release.other(),
                block.target_chrom.clone(),
                block.target_start + (pos - block.source_start),
            ))
        } else {
            None
        }
    }
}

/// Memoizing wrapper around another mapper.
#[derive(Debug, Default)]
pub struct CachedMapper<M> {
    inner: M,
    cache: Mutex<HashMap<(GenomeRelease, String, i32), Option<LiftedCoordinates>>>,
}

impl<M: CoordinateMapper> CachedMapper<M> {
    /// Wrap `inner`.
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of memoized lookups.
    pub fn cached_count(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

impl<M: CoordinateMapper> CoordinateMapper for CachedMapper<M> {
    fn map(&self, release: GenomeRelease, chrom: &str, pos: i32) -> Option<LiftedCoordinates> {
        let key = (release, chrom.to_string(), pos);
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }
        let result = self.inner.map(release, chrom, pos);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, result.clone());
        }
        result
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn mapper() -> ChainMapper {
        let tsv = "source_release\tsource_chrom\tsource_start\ttarget_chrom\ttarget_start\tlength\n\
                   # comment\n\
                   38\tchr1\t1000\tchr1\t900\t100\n\
                   38\tchr1\t1\tchr1\t1\t500\n\
                   37\t1\t900\t1\t1000\t100\n";
        ChainMapper::from_reader(tsv.as_bytes()).expect("valid TSV")
    }

    #[rstest]
    #[case(GenomeRelease::Grch38, "1", 1000, Some(900))]
    #[case(GenomeRelease::Grch38, "chr1", 1099, Some(999))]
    #[case(GenomeRelease::Grch38, "1", 1100, None)]
    #[case(GenomeRelease::Grch38, "1", 600, None)]
    #[case(GenomeRelease::Grch38, "1", 250, Some(250))]
    #[case(GenomeRelease::Grch37, "1", 950, Some(1050))]
    #[case(GenomeRelease::Grch37, "2", 950, None)]
    fn chain_mapping(
        #[case] release: GenomeRelease,
        #[case] chrom: &str,
        #[case] pos: i32,
        #[case] expected: Option<i32>,
    ) {
        let mapped = mapper().map(release, chrom, pos);
        assert_eq!(mapped.as_ref().map(|m| m.pos), expected);
        if let Some(mapped) = mapped {
            assert_eq!(mapped.genome_version, release.other());
            assert_eq!(mapped.chrom, "1");
        }
    }

    #[test]
    fn cached_mapper() {
        let mapper = CachedMapper::new(mapper());
        assert_eq!(mapper.cached_count(), 0);
        let first = mapper.map(GenomeRelease::Grch38, "1", 1000);
        let second = mapper.map(GenomeRelease::Grch38, "1", 1000);
        assert_eq!(first, second);
        assert_eq!(mapper.map(GenomeRelease::Grch38, "1", 5000), None);
        assert_eq!(mapper.cached_count(), 2);
    }
}
