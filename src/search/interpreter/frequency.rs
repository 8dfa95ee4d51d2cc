//! Population frequency part of the annotation predicate.

use indexmap::IndexMap;

use crate::{
    err::SearchError,
    search::{
        interpreter::{Field, Predicate, PredicateSettings},
        schema::FrequencyCutoff,
    },
};

/// Build the frequency predicate.
///
/// Absent values always pass.  If `pathogenic` is given and the user's AF cutoff for the
/// override population is stricter than the override threshold, pathogenic variants up
/// to the override threshold also pass.
pub fn frequency_predicate(
    frequencies: &IndexMap<String, FrequencyCutoff>,
    pathogenic: Option<&Predicate>,
    settings: &PredicateSettings,
) -> Result<Predicate, SearchError> {
    let mut result = Vec::new();
    for (population, cutoff) in frequencies {
        result.push(population_predicate(population, cutoff, pathogenic, settings)?);
    }
    Ok(Predicate::and(result))
}

fn population_predicate(
    population: &str,
    cutoff: &FrequencyCutoff,
    pathogenic: Option<&Predicate>,
    settings: &PredicateSettings,
) -> Result<Predicate, SearchError> {
    let mut preds = Vec::new();

    if let Some(af) = cutoff.af {
        if !(0.0..=1.0).contains(&af) {
            return Err(SearchError::InvalidConfiguration {
                field: format!("frequencies.{}.af", population),
                message: format!("allele frequency {} is not in [0, 1]", af),
            });
        }
        let field = Field::PopulationAf(population.to_string());
        let af_pred = Predicate::at_most_or_missing(field.clone(), af);
        match pathogenic {
            Some(pathogenic)
                if population == settings.pathogenic_override_population
                    && af < settings.pathogenic_override_af =>
            {
                tracing::debug!(
                    "widening {} AF cutoff {} to {} for pathogenic variants",
                    population,
                    af,
                    settings.pathogenic_override_af
                );
                preds.push(Predicate::or(vec![
                    af_pred,
                    Predicate::and(vec![
                        pathogenic.clone(),
                        Predicate::Range {
                            field,
                            min: None,
                            max: Some(settings.pathogenic_override_af),
                        },
                    ]),
                ]));
            }
            _ => preds.push(af_pred),
        }
    }

    if let Some(ac) = cutoff.ac {
        check_count(population, "ac", ac)?;
        preds.push(Predicate::at_most_or_missing(
            Field::PopulationAc(population.to_string()),
            ac as f64,
        ));
    }

    if let Some(hh) = cutoff.hh {
        check_count(population, "hh", hh)?;
        preds.push(Predicate::at_most_or_missing(
            Field::PopulationHom(population.to_string()),
            hh as f64,
        ));
        preds.push(Predicate::at_most_or_missing(
            Field::PopulationHemi(population.to_string()),
            hh as f64,
        ));
    }

    Ok(Predicate::and(preds))
}

fn check_count(population: &str, metric: &str, value: i64) -> Result<(), SearchError> {
    if value < 0 {
        Err(SearchError::InvalidConfiguration {
            field: format!("frequencies.{}.{}", population, metric),
            message: format!("count {} is negative", value),
        })
    } else {
        Ok(())
    }
}
