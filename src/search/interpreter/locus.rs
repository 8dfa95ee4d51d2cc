//! Locus part of the variant predicate.
//!
//! Genes are expanded into intervals of the data source's genome build.  Intervals and
//! variant ids given in the search build are lifted to the source build if they differ.

use regex::Regex;

use crate::{
    common::{canonicalize_chrom, GenomeRelease},
    err::SearchError,
    search::{
        interpreter::{Field, Predicate},
        liftover::CoordinateMapper,
        lookup::GeneLookup,
        schema::Locus,
    },
};

/// A parsed interval with 1-based inclusive coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Interval {
    chrom: String,
    start: i32,
    end: i32,
}

fn invalid(field: &str, value: &str) -> SearchError {
    SearchError::InvalidConfiguration {
        field: format!("locus.{}", field),
        message: format!("cannot parse {:?}", value),
    }
}

fn parse_interval(value: &str) -> Result<Interval, SearchError> {
    let re = Regex::new(r"^(?:chr)?([0-9A-Za-z_.]+):(\d[\d,]*)-(\d[\d,]*)$")
        .expect("invalid regex in source code");
    let caps = re
        .captures(value.trim())
        .ok_or_else(|| invalid("intervals", value))?;
    let number = |idx: usize| -> Result<i32, SearchError> {
        caps[idx]
            .replace(',', "")
            .parse::<i32>()
            .map_err(|_| invalid("intervals", value))
    };
    let (start, end) = (number(2)?, number(3)?);
    if start > end {
        return Err(invalid("intervals", value));
    }
    Ok(Interval {
        chrom: canonicalize_chrom(&caps[1]),
        start,
        end,
    })
}

/// Parsed raw variant id.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawId {
    Rsid(String),
    Variant {
        chrom: String,
        pos: i32,
        reference: String,
        alternative: String,
    },
}

fn parse_raw_id(value: &str) -> Result<RawId, SearchError> {
    let value = value.trim();
    let re_rsid = Regex::new(r"^rs\d+$").expect("invalid regex in source code");
    if re_rsid.is_match(value) {
        return Ok(RawId::Rsid(value.to_string()));
    }
    let re_variant = Regex::new(r"^(?:chr)?([0-9A-Za-z_.]+)-(\d+)-([ACGTNacgtn]+)-([ACGTNacgtn]+)$")
        .expect("invalid regex in source code");
    let caps = re_variant
        .captures(value)
        .ok_or_else(|| invalid("rawVariantIds", value))?;
    Ok(RawId::Variant {
        chrom: canonicalize_chrom(&caps[1]),
        pos: caps[2]
            .parse()
            .map_err(|_| invalid("rawVariantIds", value))?,
        reference: caps[3].to_ascii_uppercase(),
        alternative: caps[4].to_ascii_uppercase(),
    })
}

/// Canonical variant id "chrom-pos-ref-alt".
pub fn variant_id(chrom: &str, pos: i32, reference: &str, alternative: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        canonicalize_chrom(chrom),
        pos,
        reference,
        alternative
    )
}

/// Lift an interval, `None` if an end point cannot be mapped consistently.
fn lift_interval(
    interval: &Interval,
    release: GenomeRelease,
    mapper: &dyn CoordinateMapper,
) -> Option<Interval> {
    let start = mapper.map(release, &interval.chrom, interval.start)?;
    let end = mapper.map(release, &interval.chrom, interval.end)?;
    if start.chrom != end.chrom {
        return None;
    }
    Some(Interval {
        chrom: start.chrom,
        start: start.pos.min(end.pos),
        end: start.pos.max(end.pos),
    })
}

/// Build the locus predicate for a data source of `source_release`.
///
/// Returns `None` if no location is given.
pub fn locus_predicate(
    locus: &Locus,
    source_release: GenomeRelease,
    genes: &dyn GeneLookup,
    mapper: &dyn CoordinateMapper,
) -> Result<Option<Predicate>, SearchError> {
    if !locus.has_location() {
        return Ok(None);
    }
    let search_release = locus.genome_version.unwrap_or_default();
    let mut preds = Vec::new();

    for gene in genes.genes(&locus.genes)? {
        match &gene.coordinates[source_release] {
            Some(coords) => preds.push(Predicate::Interval {
                chrom: canonicalize_chrom(&coords.chrom),
                start: coords.start,
                end: coords.end,
            }),
            None => {
                tracing::warn!(
                    "gene {} has no {} coordinates, matching by gene id",
                    &gene.gene_id,
                    source_release
                );
                preds.push(Predicate::AnyOf {
                    field: Field::GeneId,
                    values: vec![gene.gene_id.clone()],
                });
            }
        }
    }

    for value in &locus.intervals {
        let interval = parse_interval(value)?;
        let interval = if source_release == search_release {
            Some(interval)
        } else {
            lift_interval(&interval, search_release, mapper)
        };
        match interval {
            Some(Interval { chrom, start, end }) => {
                preds.push(Predicate::Interval { chrom, start, end })
            }
            None => tracing::warn!(
                "dropping interval {} that cannot be lifted to {}",
                value,
                source_release
            ),
        }
    }

    let mut rsids = Vec::new();
    let mut variant_ids = Vec::new();
    for value in &locus.raw_variant_ids {
        match parse_raw_id(value)? {
            RawId::Rsid(rsid) => rsids.push(rsid),
            RawId::Variant {
                chrom,
                pos,
                reference,
                alternative,
            } => {
                let lifted = if source_release == search_release {
                    Some((chrom, pos))
                } else {
                    mapper
                        .map(search_release, &chrom, pos)
                        .map(|lifted| (lifted.chrom, lifted.pos))
                };
                match lifted {
                    Some((chrom, pos)) => {
                        variant_ids.push(variant_id(&chrom, pos, &reference, &alternative))
                    }
                    None => tracing::warn!(
                        "dropping variant {} that cannot be lifted to {}",
                        value,
                        source_release
                    ),
                }
            }
        }
    }
    if !variant_ids.is_empty() {
        preds.push(Predicate::AnyOf {
            field: Field::VariantId,
            values: variant_ids,
        });
    }
    if !rsids.is_empty() {
        preds.push(Predicate::AnyOf {
            field: Field::Rsid,
            values: rsids,
        });
    }

    let result = Predicate::or(preds);
    if locus.exclude_locations {
        Ok(Some(Predicate::Not(Box::new(result))))
    } else {
        Ok(Some(result))
    }
}

/// Genes compound heterozygous buckets are restricted to, `None` for no restriction.
pub fn comp_het_gene_ids(locus: &Locus) -> Option<Vec<String>> {
    if locus.exclude_locations || locus.genes.is_empty() {
        None
    } else {
        Some(locus.genes.clone())
    }
}

#[cfg(test)]
mod test {
    use enum_map::EnumMap;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::search::{
        liftover::{ChainBlock, ChainMapper},
        lookup::{GeneCoordinates, GeneInfo, InMemoryGenes},
        schema::VariantRecord,
    };

    fn genes() -> InMemoryGenes {
        let mut coordinates = EnumMap::default();
        coordinates[GenomeRelease::Grch38] = Some(GeneCoordinates::new(String::from("chr1"), 1000, 2000));
        coordinates[GenomeRelease::Grch37] = Some(GeneCoordinates::new(String::from("1"), 900, 1900));
        let mut only_38 = EnumMap::default();
        only_38[GenomeRelease::Grch38] = Some(GeneCoordinates::new(String::from("2"), 10, 20));
        InMemoryGenes::new(vec![
            GeneInfo {
                gene_id: String::from("G1"),
                symbol: None,
                coordinates,
            },
            GeneInfo {
                gene_id: String::from("G2"),
                symbol: None,
                coordinates: only_38,
            },
        ])
    }

    fn mapper() -> ChainMapper {
        let mut mapper = ChainMapper::default();
        mapper.add_block(
            GenomeRelease::Grch38,
            "1",
            ChainBlock::new(1, String::from("1"), 101, 10_000),
        );
        mapper
    }

    #[rstest]
    #[case("chr1:100-200", Some(("1", 100, 200)))]
    #[case("X:1,000-2,000", Some(("X", 1000, 2000)))]
    #[case("1:200-100", None)]
    #[case("foo", None)]
    fn interval_parsing(#[case] value: &str, #[case] expected: Option<(&str, i32, i32)>) {
        let parsed = parse_interval(value).ok();
        assert_eq!(
            parsed.as_ref().map(|i| (i.chrom.as_str(), i.start, i.end)),
            expected
        );
    }

    #[rstest]
    #[case("rs123", Some(RawId::Rsid(String::from("rs123"))))]
    #[case("chr1-100-a-G", Some(RawId::Variant { chrom: String::from("1"), pos: 100, reference: String::from("A"), alternative: String::from("G") }))]
    #[case("1:100:A:G", None)]
    fn raw_id_parsing(#[case] value: &str, #[case] expected: Option<RawId>) {
        assert_eq!(parse_raw_id(value).ok(), expected);
    }

    #[test]
    fn no_location() -> Result<(), anyhow::Error> {
        assert_eq!(
            locus_predicate(&Locus::default(), GenomeRelease::Grch38, &genes(), &mapper())?,
            None
        );
        Ok(())
    }

    #[test]
    fn genes_expand_per_build() -> Result<(), anyhow::Error> {
        let locus = Locus {
            genes: vec![String::from("G1")],
            ..Default::default()
        };
        let pred_38 = locus_predicate(&locus, GenomeRelease::Grch38, &genes(), &mapper())?;
        assert_eq!(
            pred_38,
            Some(Predicate::Interval {
                chrom: String::from("1"),
                start: 1000,
                end: 2000
            })
        );
        let pred_37 = locus_predicate(&locus, GenomeRelease::Grch37, &genes(), &mapper())?;
        assert_eq!(
            pred_37,
            Some(Predicate::Interval {
                chrom: String::from("1"),
                start: 900,
                end: 1900
            })
        );

        let locus = Locus {
            genes: vec![String::from("G2")],
            ..Default::default()
        };
        let pred = locus_predicate(&locus, GenomeRelease::Grch37, &genes(), &mapper())?;
        assert_eq!(
            pred,
            Some(Predicate::AnyOf {
                field: Field::GeneId,
                values: vec![String::from("G2")]
            })
        );
        Ok(())
    }

    #[test]
    fn unknown_gene() {
        let locus = Locus {
            genes: vec![String::from("G3")],
            ..Default::default()
        };
        let result = locus_predicate(&locus, GenomeRelease::Grch38, &genes(), &mapper());
        assert!(matches!(result, Err(SearchError::UnknownGene { .. })));
    }

    #[test]
    fn intervals_and_ids_are_lifted() -> Result<(), anyhow::Error> {
        let locus = Locus {
            intervals: vec![String::from("1:100-200"), String::from("2:1-5")],
            raw_variant_ids: vec![String::from("1-150-A-G"), String::from("rs1")],
            genome_version: Some(GenomeRelease::Grch38),
            ..Default::default()
        };
        let pred = locus_predicate(&locus, GenomeRelease::Grch37, &genes(), &mapper())?;
        assert_eq!(
            pred,
            Some(Predicate::Or(vec![
                Predicate::Interval {
                    chrom: String::from("1"),
                    start: 200,
                    end: 300
                },
                Predicate::AnyOf {
                    field: Field::VariantId,
                    values: vec![String::from("1-250-A-G")]
                },
                Predicate::AnyOf {
                    field: Field::Rsid,
                    values: vec![String::from("rs1")]
                },
            ]))
        );
        Ok(())
    }

    #[test]
    fn exclude_locations() -> Result<(), anyhow::Error> {
        let locus = Locus {
            intervals: vec![String::from("1:100-200")],
            exclude_locations: true,
            ..Default::default()
        };
        let pred = locus_predicate(&locus, GenomeRelease::Grch38, &genes(), &mapper())?
            .expect("location given");
        let inside = VariantRecord {
            chrom: String::from("1"),
            pos: 150,
            ..Default::default()
        };
        let outside = VariantRecord {
            chrom: String::from("1"),
            pos: 250,
            ..Default::default()
        };
        assert!(!pred.eval(&inside));
        assert!(pred.eval(&outside));
        assert_eq!(comp_het_gene_ids(&locus), None);
        Ok(())
    }
}
