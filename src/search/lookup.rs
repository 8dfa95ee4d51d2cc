//! Read-only lookups of genes and of the family/individual/sample graph.

use std::{path::Path, time::Instant};

use enum_map::EnumMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thousands::Separable;

use crate::{
    common::GenomeRelease,
    err::SearchError,
    search::schema::{AffectedStatus, Family, Individual, Sample},
};

/// Location of a gene in one genome build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct GeneCoordinates {
    /// Chromosome name.
    pub chrom: String,
    /// 1-based start position.
    pub start: i32,
    /// 1-based inclusive end position.
    pub end: i32,
}

/// Information about one gene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneInfo {
    /// Gene identifier, e.g., ENSEMBL gene id.
    pub gene_id: String,
    /// Gene symbol.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Coordinates in each build.
    #[serde(default)]
    pub coordinates: EnumMap<GenomeRelease, Option<GeneCoordinates>>,
}

/// Lookup of genes by id.
pub trait GeneLookup: Send + Sync {
    /// The gene, `None` if unknown.
    fn gene(&self, gene_id: &str) -> Option<&GeneInfo>;

    /// Resolve all gene ids, failing on unknown ones.
    fn genes(&self, gene_ids: &[String]) -> Result<Vec<&GeneInfo>, SearchError> {
        let mut found = Vec::new();
        let mut unknown = Vec::new();
        for gene_id in gene_ids {
            match self.gene(gene_id) {
                Some(gene) => found.push(gene),
                None => unknown.push(gene_id.clone()),
            }
        }
        if unknown.is_empty() {
            Ok(found)
        } else {
            Err(SearchError::UnknownGene { gene_ids: unknown })
        }
    }
}

/// Gene lookup from an in-memory table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGenes {
    genes: IndexMap<String, GeneInfo>,
}

impl InMemoryGenes {
    /// Construct from gene records.
    pub fn new(genes: Vec<GeneInfo>) -> Self {
        Self {
            genes: genes
                .into_iter()
                .map(|gene| (gene.gene_id.clone(), gene))
                .collect(),
        }
    }

    /// Load from a JSON file with an array of genes.
    #[tracing::instrument]
    pub fn from_path(path: &Path) -> Result<Self, anyhow::Error> {
        tracing::debug!("loading genes from {:?}...", path);
        let before_loading = Instant::now();
        let genes: Vec<GeneInfo> = serde_json::from_reader(std::io::BufReader::new(
            std::fs::File::open(path)?,
        ))?;
        let result = Self::new(genes);
        tracing::debug!(
            "... done loading {} genes in {:?}",
            result.genes.len().separate_with_commas(),
            before_loading.elapsed()
        );
        Ok(result)
    }
}

impl GeneLookup for InMemoryGenes {
    fn gene(&self, gene_id: &str) -> Option<&GeneInfo> {
        self.genes.get(gene_id)
    }
}

/// Membership of one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMembership {
    /// Family identifier.
    pub family_id: String,
    /// Individual identifier.
    pub individual_id: String,
}

/// Index of the family/individual/sample graph of one search request.
#[derive(Debug, Clone, Default)]
pub struct FamilyIndex {
    /// Families by id, in request order.
    families: IndexMap<String, Family>,
    /// Family and individual of each sample.
    samples: IndexMap<String, SampleMembership>,
}

impl FamilyIndex {
    /// Build the index, failing for samples of individuals outside of `families`.
    pub fn new(families: &[Family], samples: &[Sample]) -> Result<Self, SearchError> {
        let families: IndexMap<String, Family> = families
            .iter()
            .map(|family| (family.family_id.clone(), family.clone()))
            .collect();
        let mut individual_family = IndexMap::new();
        for family in families.values() {
            for individual in &family.individuals {
                individual_family.insert(individual.individual_id.clone(), family.family_id.clone());
            }
        }

        let mut result = IndexMap::new();
        for sample in samples {
            let family_id = individual_family.get(&sample.individual_id).ok_or_else(|| {
                SearchError::UnknownSample {
                    sample_id: sample.sample_id.clone(),
                }
            })?;
            result.insert(
                sample.sample_id.clone(),
                SampleMembership {
                    family_id: family_id.clone(),
                    individual_id: sample.individual_id.clone(),
                },
            );
        }

        Ok(Self {
            families,
            samples: result,
        })
    }

    /// Family and individual of the sample.
    pub fn sample(&self, sample_id: &str) -> Option<&SampleMembership> {
        self.samples.get(sample_id)
    }

    /// The family.
    pub fn family(&self, family_id: &str) -> Option<&Family> {
        self.families.get(family_id)
    }

    /// Position of the family in request order.
    pub fn family_rank(&self, family_id: &str) -> Option<usize> {
        self.families.get_index_of(family_id)
    }

    /// The individual.
    pub fn individual(&self, individual_id: &str) -> Option<&Individual> {
        self.families
            .values()
            .flat_map(|family| family.individuals.iter())
            .find(|ind| ind.individual_id == individual_id)
    }

    /// Families in request order.
    pub fn families(&self) -> impl Iterator<Item = &Family> {
        self.families.values()
    }

    /// Number of families with at least one affected individual.
    pub fn affected_family_count(&self) -> usize {
        self.families
            .values()
            .filter(|family| {
                family
                    .individuals
                    .iter()
                    .any(|ind| ind.affected == AffectedStatus::Affected)
            })
            .count()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::search::schema::{DatasetType, Sex};

    fn genes() -> InMemoryGenes {
        let mut coordinates = EnumMap::default();
        coordinates[GenomeRelease::Grch38] = Some(GeneCoordinates::new(String::from("1"), 100, 200));
        InMemoryGenes::new(vec![GeneInfo {
            gene_id: String::from("ENSG1"),
            symbol: Some(String::from("GENE1")),
            coordinates,
        }])
    }

    #[test]
    fn gene_lookup() {
        let genes = genes();
        assert_eq!(
            genes.gene("ENSG1").and_then(|g| g.symbol.clone()),
            Some(String::from("GENE1"))
        );
        let err = genes
            .genes(&[String::from("ENSG1"), String::from("ENSG2")])
            .unwrap_err();
        assert_eq!(
            err,
            SearchError::UnknownGene {
                gene_ids: vec![String::from("ENSG2")]
            }
        );
    }

    #[test]
    fn gene_info_json() -> Result<(), anyhow::Error> {
        let gene: GeneInfo = serde_json::from_str(
            r#"{"geneId": "ENSG1", "coordinates": {"37": null, "38": {"chrom": "1", "start": 1, "end": 5}}}"#,
        )?;
        assert_eq!(gene.coordinates[GenomeRelease::Grch37], None);
        assert_eq!(
            gene.coordinates[GenomeRelease::Grch38],
            Some(GeneCoordinates::new(String::from("1"), 1, 5))
        );
        Ok(())
    }

    #[test]
    fn family_index() -> Result<(), anyhow::Error> {
        let families = vec![
            Family::new(
                String::from("F1"),
                vec![Individual::new(
                    String::from("I1"),
                    Sex::Male,
                    AffectedStatus::Affected,
                )],
            ),
            Family::new(
                String::from("F2"),
                vec![Individual::new(
                    String::from("I2"),
                    Sex::Female,
                    AffectedStatus::Unaffected,
                )],
            ),
        ];
        let samples = vec![Sample::new(
            String::from("S2"),
            String::from("I2"),
            String::from("idx"),
            DatasetType::SnvIndel,
            GenomeRelease::Grch38,
        )];
        let index = FamilyIndex::new(&families, &samples)?;
        assert_eq!(
            index.sample("S2").map(|m| m.family_id.as_str()),
            Some("F2")
        );
        assert_eq!(index.family_rank("F2"), Some(1));
        assert_eq!(index.affected_family_count(), 1);

        let bad = vec![Sample::new(
            String::from("S3"),
            String::from("I3"),
            String::from("idx"),
            DatasetType::SnvIndel,
            GenomeRelease::Grch38,
        )];
        assert!(matches!(
            FamilyIndex::new(&families, &bad),
            Err(SearchError::UnknownSample { .. })
        ));
        Ok(())
    }
}
