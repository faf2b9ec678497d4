//! Candidate instruction-set generation.
//!
//! One generation call proposes several replacement instruction sets. Each
//! proposal then passes a structural contract check against the instruction
//! set it would replace: downstream parsing is bound to the template names
//! and the literal output-field names inside them, so those must survive.
//! Proposals that break the contract are dropped; softer problems are kept
//! as warnings on the candidate.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, OnceLock};

use evolve_state::{ContentDigest, Dimension, InstructionSet, PromptTemplate};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::domain::FeedbackAnalysis;
use crate::generation::{GenerationRequest, TextGeneration};
use crate::parse::{parse_model_output, ParseOutcome};

pub const MIN_SYSTEM_TEXT_CHARS: usize = 50;
pub const MIN_RATIONALE_CHARS: usize = 20;

const GENERATOR_SYSTEM_PROMPT: &str = "You improve the instructions of an AI agent. \
You receive the agent's current system text and prompt templates plus an analysis of user \
feedback. Propose improved versions that address the weaknesses. \
Hard constraints: keep exactly the same template names; keep every literal output field name \
(quoted JSON keys such as \"title\") unchanged, because downstream parsing depends on them; \
keep every {{placeholder}} the templates already use. \
Respond with a single JSON object and nothing else, shaped as: \
{\"rationale\": \"overall approach\", \"targets\": [\"quality\"], \"candidates\": \
[{\"system_text\": \"...\", \"templates\": {\"<template name>\": \"<body>\"}, \"rationale\": \"...\"}]}";

/// Quoted JSON keys (`"name":`) referenced inside a template body.
fn quoted_key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#""([A-Za-z_][A-Za-z0-9_]*)"\s*:"#).ok())
        .as_ref()
}

/// Literal output-field names referenced by a template body, in order of first use.
pub fn output_field_names(body: &str) -> Vec<String> {
    let Some(pattern) = quoted_key_pattern() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    pattern
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// A proposal that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCandidate {
    pub instruction_set: InstructionSet,
    pub rationale: String,
    pub warnings: Vec<String>,
}

/// Result of a generation request. Never an error: failures surface as an
/// empty candidate list and an explanatory rationale.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub candidates: Vec<GeneratedCandidate>,
    pub rationale: String,
    pub targets: Vec<Dimension>,
    /// Why individual proposals were dropped.
    pub rejected: Vec<String>,
}

impl GenerationOutcome {
    fn failed(rationale: impl Into<String>, targets: Vec<Dimension>) -> Self {
        Self {
            candidates: Vec::new(),
            rationale: rationale.into(),
            targets,
            rejected: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    system_text: Option<String>,
    #[serde(default)]
    templates: Option<BTreeMap<String, String>>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    model_options: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    /// Typed one at a time so a badly shaped entry only costs itself.
    #[serde(default)]
    candidates: Vec<serde_json::Value>,
}

/// Check a raw proposal against the instruction set it would replace.
fn validate_candidate(
    original: &InstructionSet,
    raw: RawCandidate,
) -> std::result::Result<GeneratedCandidate, String> {
    let system_text = raw
        .system_text
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if system_text.is_empty() {
        return Err("missing system text".to_string());
    }
    if system_text.chars().count() < MIN_SYSTEM_TEXT_CHARS {
        return Err(format!(
            "system text shorter than {MIN_SYSTEM_TEXT_CHARS} characters"
        ));
    }

    let mut templates = match raw.templates {
        Some(t) if !t.is_empty() => t,
        _ => return Err("missing templates".to_string()),
    };
    let expected: BTreeSet<&str> = original.templates.iter().map(|t| t.name.as_str()).collect();
    let proposed: BTreeSet<&str> = templates.keys().map(String::as_str).collect();
    if expected != proposed {
        return Err(format!(
            "template names {proposed:?} do not match {expected:?}"
        ));
    }

    let mut warnings = Vec::new();
    let mut ordered = Vec::with_capacity(original.templates.len());
    for template in &original.templates {
        let body = templates.remove(&template.name).unwrap_or_default();
        for field in output_field_names(&template.body) {
            if !body.contains(&format!("\"{field}\"")) {
                warnings.push(format!(
                    "template '{}' no longer mentions output field \"{field}\"",
                    template.name
                ));
            }
        }
        ordered.push(PromptTemplate::new(template.name.clone(), body));
    }

    let rationale = raw.rationale.map(|r| r.trim().to_string()).unwrap_or_default();
    if rationale.chars().count() < MIN_RATIONALE_CHARS {
        warnings.push("rationale missing or too short".to_string());
    }

    Ok(GeneratedCandidate {
        instruction_set: InstructionSet {
            system_text,
            templates: ordered,
            model_options: raw.model_options.or_else(|| original.model_options.clone()),
        },
        rationale,
        warnings,
    })
}

pub struct CandidateGenerator {
    generation: Arc<dyn TextGeneration>,
}

impl CandidateGenerator {
    pub fn new(generation: Arc<dyn TextGeneration>) -> Self {
        Self { generation }
    }

    /// Propose up to `count` distinct replacements for `current`.
    #[instrument(skip(self, current, analysis), fields(subject_id = %analysis.subject_id))]
    pub async fn generate_candidates(
        &self,
        current: &InstructionSet,
        analysis: &FeedbackAnalysis,
        count: usize,
    ) -> GenerationOutcome {
        let fallback_targets: Vec<Dimension> =
            analysis.priorities.iter().map(|p| p.dimension).collect();
        let user = format!(
            "{}\n{}\nPropose {count} distinct improved versions.",
            render_instruction_set(current),
            render_analysis(analysis),
        );
        self.request(current, user, count, fallback_targets).await
    }

    /// Propose one replacement aimed at a single weakness.
    #[instrument(skip(self, current, issue))]
    pub async fn generate_focused_improvement(
        &self,
        current: &InstructionSet,
        dimension: Dimension,
        issue: &str,
    ) -> GenerationOutcome {
        let actions = crate::feedback_analyzer::default_actions(dimension);
        let user = format!(
            "{}\nFocus only on {dimension}. Reported issue: {issue}\nUseful directions:\n- {}\n\
             Propose exactly 1 improved version.",
            render_instruction_set(current),
            actions.join("\n- "),
        );
        self.request(current, user, 1, vec![dimension]).await
    }

    async fn request(
        &self,
        current: &InstructionSet,
        user: String,
        count: usize,
        fallback_targets: Vec<Dimension>,
    ) -> GenerationOutcome {
        let request = GenerationRequest::new(GENERATOR_SYSTEM_PROMPT, user);
        let response = match self.generation.generate(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "candidate generation call failed");
                return GenerationOutcome::failed(
                    format!("generation call failed: {e}"),
                    fallback_targets,
                );
            }
        };

        let proposal = match parse_model_output::<RawProposal>(&response.content) {
            ParseOutcome::Parsed(p) => p,
            ParseOutcome::Malformed(reason) => {
                warn!(%reason, "candidate output malformed");
                return GenerationOutcome::failed(
                    format!("unparseable generation output: {reason}"),
                    fallback_targets,
                );
            }
        };

        let targets: Vec<Dimension> = proposal
            .targets
            .iter()
            .filter_map(|t| Dimension::parse(t))
            .collect();
        let targets = if targets.is_empty() {
            fallback_targets
        } else {
            targets
        };

        let original_digest = current.digest();
        let mut seen: HashSet<ContentDigest> = HashSet::new();
        let mut candidates = Vec::new();
        let mut rejected = Vec::new();
        for (i, value) in proposal.candidates.into_iter().enumerate() {
            let checked = serde_json::from_value::<RawCandidate>(value)
                .map_err(|e| format!("malformed: {e}"))
                .and_then(|raw| validate_candidate(current, raw));
            match checked {
                Ok(candidate) => {
                    let digest = candidate.instruction_set.digest();
                    if digest == original_digest {
                        rejected.push(format!("candidate {i}: identical to current instructions"));
                    } else if !seen.insert(digest) {
                        rejected.push(format!("candidate {i}: duplicate of an earlier candidate"));
                    } else {
                        candidates.push(candidate);
                    }
                }
                Err(reason) => {
                    debug!(index = i, %reason, "candidate dropped");
                    rejected.push(format!("candidate {i}: {reason}"));
                }
            }
        }
        candidates.truncate(count);

        info!(
            accepted = candidates.len(),
            dropped = rejected.len(),
            "candidates validated"
        );

        let rationale = match proposal.rationale {
            Some(r) if !r.trim().is_empty() => r.trim().to_string(),
            _ if candidates.is_empty() => "no proposal passed validation".to_string(),
            _ => format!("{} candidate(s) proposed", candidates.len()),
        };

        GenerationOutcome {
            candidates,
            rationale,
            targets,
            rejected,
        }
    }
}

fn render_instruction_set(set: &InstructionSet) -> String {
    let mut out = format!("CURRENT SYSTEM TEXT:\n{}\n\nCURRENT TEMPLATES:\n", set.system_text);
    for t in &set.templates {
        out.push_str(&format!("--- template \"{}\" ---\n{}\n", t.name, t.body));
    }
    let fields: BTreeSet<String> = set
        .templates
        .iter()
        .flat_map(|t| output_field_names(&t.body))
        .collect();
    if !fields.is_empty() {
        let fields: Vec<String> = fields.into_iter().collect();
        out.push_str(&format!(
            "\nOUTPUT FIELD NAMES THAT MUST NOT CHANGE: {}\n",
            fields.join(", ")
        ));
    }
    out
}

fn render_analysis(analysis: &FeedbackAnalysis) -> String {
    let a = &analysis.summary.averages;
    let mut out = format!(
        "FEEDBACK ANALYSIS ({} records, last {} days, trend {}):\n\
         Scores (0-5): overall {:.2}, relevance {:.2}, quality {:.2}, creativity {:.2}\n",
        analysis.summary.total,
        analysis.window_days,
        analysis.summary.trend.as_str(),
        a.overall,
        a.relevance,
        a.quality,
        a.creativity,
    );
    if !analysis.weaknesses.is_empty() {
        out.push_str("Weaknesses (weight 0-1):\n");
        for w in &analysis.weaknesses {
            out.push_str(&format!(
                "- {} [{:.2}]: {}\n",
                w.dimension, w.severity, w.description
            ));
        }
    }
    if !analysis.priorities.is_empty() {
        out.push_str("Priorities:\n");
        for p in &analysis.priorities {
            out.push_str(&format!(
                "{}. {}: {}\n",
                p.rank,
                p.dimension,
                p.actions.join("; ")
            ));
        }
    }
    let common = &analysis.summary.top_weaknesses;
    if !common.is_empty() {
        out.push_str("Common feedback:\n");
        for e in common {
            out.push_str(&format!("- {} (x{})\n", e.text, e.count));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original() -> InstructionSet {
        InstructionSet::new("You write short product blurbs.")
            .with_template("blurb", "Describe {{product}}. Reply as {\"title\": \"...\", \"body\": \"...\"}")
            .with_template("tagline", "One line for {{product}}: {\"tagline\": \"...\"}")
    }

    fn raw(system: &str, templates: &[(&str, &str)], rationale: &str) -> RawCandidate {
        RawCandidate {
            system_text: Some(system.to_string()),
            templates: Some(
                templates
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            rationale: Some(rationale.to_string()),
            model_options: None,
        }
    }

    const LONG_SYSTEM: &str =
        "You write short, vivid product blurbs that stay faithful to the product facts given.";

    #[test]
    fn output_fields_are_extracted_once() {
        let fields = output_field_names(r#"{"title": 1, "body" : 2, "title": 3}"#);
        assert_eq!(fields, vec!["title", "body"]);
    }

    #[test]
    fn valid_candidate_keeps_original_template_order() {
        let c = validate_candidate(
            &original(),
            raw(
                LONG_SYSTEM,
                &[
                    ("tagline", "A line for {{product}}: {\"tagline\": \"...\"}"),
                    ("blurb", "Describe {{product}} vividly: {\"title\": \"\", \"body\": \"\"}"),
                ],
                "Sharper tone and clearer structure",
            ),
        )
        .expect("valid");
        assert_eq!(c.instruction_set.template_names(), vec!["blurb", "tagline"]);
        assert!(c.warnings.is_empty(), "{:?}", c.warnings);
    }

    #[test]
    fn short_system_text_is_rejected() {
        let err = validate_candidate(
            &original(),
            raw("too short", &[("blurb", "x"), ("tagline", "y")], "long enough rationale here"),
        )
        .unwrap_err();
        assert!(err.contains("shorter"));
    }

    #[test]
    fn template_name_mismatch_is_rejected() {
        let err = validate_candidate(
            &original(),
            raw(LONG_SYSTEM, &[("blurb", "x")], "long enough rationale here"),
        )
        .unwrap_err();
        assert!(err.contains("template names"));

        let err = validate_candidate(
            &original(),
            raw(
                LONG_SYSTEM,
                &[("blurb", "x"), ("tagline", "y"), ("extra", "z")],
                "long enough rationale here",
            ),
        )
        .unwrap_err();
        assert!(err.contains("template names"));
    }

    #[test]
    fn missing_templates_are_rejected() {
        let mut r = raw(LONG_SYSTEM, &[], "long enough rationale here");
        assert_eq!(
            validate_candidate(&original(), r).unwrap_err(),
            "missing templates"
        );
        r = raw(LONG_SYSTEM, &[], "x");
        r.templates = None;
        assert_eq!(
            validate_candidate(&original(), r).unwrap_err(),
            "missing templates"
        );
    }

    #[test]
    fn dropped_field_and_short_rationale_warn() {
        let c = validate_candidate(
            &original(),
            raw(
                LONG_SYSTEM,
                &[
                    ("blurb", "Describe {{product}}: {\"headline\": \"\", \"body\": \"\"}"),
                    ("tagline", "{\"tagline\": \"\"}"),
                ],
                "short",
            ),
        )
        .expect("accepted with warnings");
        assert_eq!(c.warnings.len(), 2);
        assert!(c.warnings[0].contains("\"title\""));
        assert!(c.warnings[1].contains("rationale"));
    }
}
