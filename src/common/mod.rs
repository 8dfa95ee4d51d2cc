//! Common functionality.

use byte_unit::{Byte, UnitType};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Helper to print the current memory resident set size via `tracing`.
pub fn trace_rss_now() {
    let rss = procfs::process::Process::myself()
        .and_then(|me| me.stat())
        .map(|stat| stat.rss * procfs::page_size());
    match rss {
        Ok(rss) => tracing::debug!(
            "RSS now: {:.2}",
            Byte::from_u64(rss).get_appropriate_unit(UnitType::Binary)
        ),
        Err(e) => tracing::debug!("could not determine RSS: {}", e),
    }
}

/// Definition of canonical chromosome names.
pub const CHROMS: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "M",
];

/// Offset used for computing `xpos` values from chromosome number and position.
pub const XPOS_OFFSET: i64 = 1_000_000_000;

/// Build mapping of chromosome names to chromosome counts.
pub fn build_chrom_map() -> IndexMap<String, usize> {
    let mut result = IndexMap::new();
    for (i, &chrom_name) in CHROMS.iter().enumerate() {
        result.insert(chrom_name.to_owned(), i);
        result.insert(format!("chr{chrom_name}").to_owned(), i);
    }
    result.insert("x".to_owned(), 22);
    result.insert("y".to_owned(), 23);
    result.insert("chrx".to_owned(), 22);
    result.insert("chry".to_owned(), 23);
    result.insert("mt".to_owned(), 24);
    result.insert("m".to_owned(), 24);
    result.insert("chrmt".to_owned(), 24);
    result.insert("chrm".to_owned(), 24);
    result.insert("MT".to_owned(), 24);
    result.insert("chrMT".to_owned(), 24);
    result
}

/// Canonicalize chromosome name, e.g., "chr1" to "1" and "chrMT" to "M".
pub fn canonicalize_chrom(chrom: &str) -> String {
    let stripped = chrom
        .strip_prefix("chr")
        .or_else(|| chrom.strip_prefix("CHR"))
        .unwrap_or(chrom);
    match stripped {
        "MT" | "mt" | "m" => String::from("M"),
        "x" => String::from("X"),
        "y" => String::from("Y"),
        other => other.to_owned(),
    }
}

/// Compute the 1-based chromosome number (1..=25) or `None` for non-canonical contigs.
pub fn chrom_no(chrom: &str) -> Option<i64> {
    let canonical = canonicalize_chrom(chrom);
    CHROMS
        .iter()
        .position(|c| *c == canonical)
        .map(|idx| idx as i64 + 1)
}

/// Compute the `xpos` value, a genome-wide linear coordinate.
///
/// Non-canonical contigs are placed behind all canonical ones.
pub fn xpos(chrom: &str, pos: i32) -> i64 {
    let no = chrom_no(chrom).unwrap_or(CHROMS.len() as i64 + 1);
    no * XPOS_OFFSET + pos as i64
}

/// Compute lower-case hex SHA256 checksum of `payload`.
pub fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    base16ct::lower::encode_string(&hasher.finalize())
}

/// Select the genome release to use.
#[derive(
    clap::ValueEnum,
    serde::Serialize,
    serde::Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    strum::Display,
    PartialEq,
    Eq,
    enum_map::Enum,
    PartialOrd,
    Ord,
    Hash,
)]
pub enum GenomeRelease {
    /// GRCh37 / hg19
    #[strum(serialize = "GRCh37")]
    #[serde(rename = "37", alias = "GRCh37", alias = "grch37")]
    Grch37,
    /// GRCh38 / hg38
    #[default]
    #[strum(serialize = "GRCh38")]
    #[serde(rename = "38", alias = "GRCh38", alias = "grch38")]
    Grch38,
}

impl GenomeRelease {
    /// Return the other genome release, i.e., the liftover target.
    pub fn other(&self) -> Self {
        match self {
            GenomeRelease::Grch37 => GenomeRelease::Grch38,
            GenomeRelease::Grch38 => GenomeRelease::Grch37,
        }
    }
}

impl std::str::FromStr for GenomeRelease {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        if s.starts_with("grch37") || s == "37" || s == "hg19" {
            Ok(GenomeRelease::Grch37)
        } else if s.starts_with("grch38") || s == "38" || s == "hg38" {
            Ok(GenomeRelease::Grch38)
        } else {
            Err(anyhow::anyhow!("Unknown genome release: {}", s))
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_test::{assert_de_tokens, assert_tokens, Token};

    use super::*;

    #[rstest]
    #[case("chr1", "1")]
    #[case("1", "1")]
    #[case("chrX", "X")]
    #[case("chrMT", "M")]
    #[case("MT", "M")]
    #[case("GL000192.1", "GL000192.1")]
    fn canonicalize_chrom_names(#[case] chrom: &str, #[case] expected: &str) {
        assert_eq!(canonicalize_chrom(chrom), expected);
    }

    #[test]
    fn xpos_values() {
        assert_eq!(xpos("1", 12345), 1_000_012_345);
        assert_eq!(xpos("chrX", 1), 23_000_000_001);
        assert_eq!(xpos("M", 100), 25_000_000_100);
        assert!(xpos("GL000192.1", 1) > xpos("M", 16_000));
    }

    #[test]
    fn chrom_map_smoke() {
        let map = build_chrom_map();
        assert_eq!(map.get("chr22"), Some(&21));
        assert_eq!(map.get("MT"), Some(&24));
    }

    #[test]
    fn sha256_hex_smoke() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn genome_release_serde_smoke() {
        assert_tokens(
            &GenomeRelease::Grch37,
            &[Token::UnitVariant {
                name: "GenomeRelease",
                variant: "37",
            }],
        );
        assert_de_tokens(
            &GenomeRelease::Grch38,
            &[Token::UnitVariant {
                name: "GenomeRelease",
                variant: "GRCh38",
            }],
        );
    }

    #[test]
    fn genome_release_from_str() -> Result<(), anyhow::Error> {
        assert_eq!(GenomeRelease::from_str("GRCh37")?, GenomeRelease::Grch37);
        assert_eq!(GenomeRelease::from_str("hg38")?, GenomeRelease::Grch38);
        assert!(GenomeRelease::from_str("hg18").is_err());
        assert_eq!(GenomeRelease::Grch37.other(), GenomeRelease::Grch38);
        Ok(())
    }
}
