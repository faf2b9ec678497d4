//! Scoring of a single variant output against a test case.

use std::collections::HashSet;

use evolve_state::{DimensionScores, ExpectedCriteria, TestCase};
use serde_json::Value;

/// Weight of each detail dimension in the overall score.
pub const RELEVANCE_WEIGHT: f64 = 0.4;
pub const QUALITY_WEIGHT: f64 = 0.4;
pub const CREATIVITY_WEIGHT: f64 = 0.2;

const MAX_SCORE: f64 = 5.0;
const FORBIDDEN_PENALTY: f64 = 1.5;
const SHORT_OUTPUT_PENALTY: f64 = 2.0;

/// Scores a parsed model output for one test case on the 0–5 scale.
pub trait OutputScorer: Send + Sync {
    fn score(&self, case: &TestCase, output: &Value) -> DimensionScores;
}

/// Rule-based scorer driven by the case's [`ExpectedCriteria`].
///
/// - relevance: share of required fields, expected values and keywords satisfied
/// - quality: starts at 5, penalised for forbidden terms and short output
/// - creativity: lexical diversity of the output text
#[derive(Debug, Clone, Copy, Default)]
pub struct CriteriaScorer;

impl OutputScorer for CriteriaScorer {
    fn score(&self, case: &TestCase, output: &Value) -> DimensionScores {
        let text = collect_text(output);
        if text.trim().is_empty() {
            return DimensionScores::default();
        }
        let lowered = text.to_lowercase();

        let relevance = relevance(&case.expected, output, &lowered);
        let quality = quality(&case.expected, &text, &lowered);
        let creativity = lexical_diversity(&lowered) * MAX_SCORE;
        let overall = RELEVANCE_WEIGHT * relevance
            + QUALITY_WEIGHT * quality
            + CREATIVITY_WEIGHT * creativity;

        DimensionScores::new(
            clamp(overall),
            clamp(relevance),
            clamp(quality),
            clamp(creativity),
        )
    }
}

fn clamp(score: f64) -> f64 {
    score.clamp(0.0, MAX_SCORE)
}

fn relevance(expected: &ExpectedCriteria, output: &Value, lowered: &str) -> f64 {
    let mut components = Vec::new();

    if !expected.required_fields.is_empty() {
        let present = expected
            .required_fields
            .iter()
            .filter(|f| output.get(f.as_str()).is_some_and(|v| !is_blank(v)))
            .count();
        components.push(present as f64 / expected.required_fields.len() as f64);
    }
    if !expected.expected_values.is_empty() {
        let matching = expected
            .expected_values
            .iter()
            .filter(|(k, v)| output.get(k.as_str()) == Some(*v))
            .count();
        components.push(matching as f64 / expected.expected_values.len() as f64);
    }
    if !expected.keywords.is_empty() {
        let found = expected
            .keywords
            .iter()
            .filter(|k| lowered.contains(&k.to_lowercase()))
            .count();
        components.push(found as f64 / expected.keywords.len() as f64);
    }

    if components.is_empty() {
        return MAX_SCORE;
    }
    MAX_SCORE * components.iter().sum::<f64>() / components.len() as f64
}

fn quality(expected: &ExpectedCriteria, text: &str, lowered: &str) -> f64 {
    let mut score = MAX_SCORE;
    let hits = expected
        .forbidden
        .iter()
        .filter(|f| lowered.contains(&f.to_lowercase()))
        .count();
    score -= FORBIDDEN_PENALTY * hits as f64;
    if let Some(min) = expected.min_length {
        if text.chars().count() < min {
            score -= SHORT_OUTPUT_PENALTY;
        }
    }
    score
}

/// Distinct words over total words, 0–1.
fn lexical_diversity(lowered: &str) -> f64 {
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&str> = words.iter().copied().collect();
    distinct.len() as f64 / words.len() as f64
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// All string content of a JSON value, space-joined in document order.
fn collect_text(value: &Value) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            Value::Number(n) => out.push(n.to_string()),
            Value::Bool(_) | Value::Null => {}
        }
    }
    let mut parts = Vec::new();
    walk(value, &mut parts);
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case(expected: ExpectedCriteria) -> TestCase {
        TestCase::new("writer", "case", json!({})).with_expected(expected)
    }

    #[test]
    fn empty_output_scores_zero() {
        let scores = CriteriaScorer.score(&case(ExpectedCriteria::default()), &json!({"title": ""}));
        assert_eq!(scores, DimensionScores::default());
    }

    #[test]
    fn missing_required_field_lowers_relevance() {
        let expected = ExpectedCriteria {
            required_fields: vec!["title".into(), "body".into()],
            ..Default::default()
        };
        let full = CriteriaScorer.score(
            &case(expected.clone()),
            &json!({"title": "Fresh bread", "body": "Baked every morning"}),
        );
        let partial = CriteriaScorer.score(&case(expected), &json!({"title": "Fresh bread"}));
        assert!((full.relevance - 5.0).abs() < 1e-9);
        assert!((partial.relevance - 2.5).abs() < 1e-9);
        assert!(full.overall > partial.overall);
    }

    #[test]
    fn forbidden_terms_and_short_output_lower_quality() {
        let expected = ExpectedCriteria {
            forbidden: vec!["lorem".into()],
            min_length: Some(100),
            ..Default::default()
        };
        let scores = CriteriaScorer.score(&case(expected), &json!({"body": "Lorem ipsum"}));
        assert!((scores.quality - 1.5).abs() < 1e-9);
    }

    #[test]
    fn repetition_lowers_creativity() {
        let plain = case(ExpectedCriteria::default());
        let varied = CriteriaScorer.score(&plain, &json!({"body": "crisp golden crust with soft crumb"}));
        let repeated = CriteriaScorer.score(&plain, &json!({"body": "good good good good good good"}));
        assert!(varied.creativity > repeated.creativity);
    }

    #[test]
    fn overall_is_weighted_mean() {
        let expected = ExpectedCriteria {
            keywords: vec!["bread".into(), "butter".into()],
            ..Default::default()
        };
        let s = CriteriaScorer.score(&case(expected), &json!({"body": "warm bread"}));
        let weighted = 0.4 * s.relevance + 0.4 * s.quality + 0.2 * s.creativity;
        assert!((s.overall - weighted).abs() < 1e-9);
    }
}
