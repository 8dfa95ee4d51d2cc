//! In-silico score part of the annotation predicate.

use crate::{
    err::SearchError,
    search::{
        interpreter::{Field, Predicate},
        schema::{InSilico, ScoreThreshold},
    },
};

/// Build the in-silico predicate.
///
/// A variant passes if it meets the threshold of any tool.  Unless scores are required,
/// it also passes if all selected tools' scores are missing.
pub fn in_silico_predicate(in_silico: &InSilico) -> Result<Predicate, SearchError> {
    let mut passing = Vec::new();
    let mut missing = Vec::new();
    for (tool, threshold) in &in_silico.scores {
        let field = Field::Prediction(tool.clone());
        let pred = match threshold {
            ScoreThreshold::Numeric(value) => min_score(field.clone(), *value, tool)?,
            ScoreThreshold::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match text.parse::<f64>() {
                    Ok(value) => min_score(field.clone(), value, tool)?,
                    Err(_) => Predicate::AnyOf {
                        field: field.clone(),
                        values: text
                            .split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect(),
                    },
                }
            }
        };
        passing.push(pred);
        missing.push(Predicate::Missing { field });
    }

    if passing.is_empty() {
        return Ok(Predicate::All);
    }
    if !in_silico.require_score {
        passing.push(Predicate::and(missing));
    }
    Ok(Predicate::or(passing))
}

fn min_score(field: Field, value: f64, tool: &str) -> Result<Predicate, SearchError> {
    if value.is_nan() {
        return Err(SearchError::InvalidConfiguration {
            field: format!("inSilico.{}", tool),
            message: String::from("score threshold is not a number"),
        });
    }
    Ok(Predicate::Range {
        field,
        min: Some(value),
        max: None,
    })
}
