//! Feedback aggregation and weakness analysis.
//!
//! [`FeedbackAnalyzer::analyze_agent_feedback`] turns the raw feedback of a
//! time window into a [`FeedbackAnalysis`]: a statistical summary computed
//! locally, plus weak areas and improvement priorities. With enough samples
//! the qualitative part is delegated to one text-generation call; if that
//! call fails or its output does not parse, deterministic threshold rules
//! are used instead.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use evolve_state::{Dimension, DimensionScores, FeedbackRecord, FeedbackStore};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::domain::{
    AnalysisSource, FeedbackAnalysis, FeedbackSummary, FrequencyEntry, ImprovementPriority,
    Result, ScoreDistribution, Trend, WeakArea,
};
use crate::generation::{GenerationRequest, TextGeneration};
use crate::parse::{parse_model_output, ParseOutcome};

pub const DEFAULT_WINDOW_DAYS: u32 = 30;

/// Minimum sample size before a model is asked for the qualitative analysis.
pub const MODEL_ANALYSIS_MIN_RECORDS: usize = 5;

const TOP_N: usize = 5;
const TREND_DEAD_BAND: f64 = 0.2;
const WEAK_SCORE: f64 = 3.0;
const WEAK_FRACTION: f64 = 0.3;

const ANALYSIS_SYSTEM_PROMPT: &str = "You evaluate feedback about an AI agent's outputs. \
Identify the agent's weakest scoring dimensions and the concrete changes to its instructions \
that would address them. Dimensions are: relevance, quality, creativity. \
Respond with a single JSON object and nothing else, shaped as: \
{\"weaknesses\": [{\"dimension\": \"quality\", \"severity\": 0.0-1.0, \"description\": \"...\"}], \
\"priorities\": [{\"dimension\": \"quality\", \"actions\": [\"...\"]}]}. \
List priorities most urgent first.";

/// Fixed improvement actions per dimension, used when no model analysis is available.
pub fn default_actions(dimension: Dimension) -> Vec<String> {
    let actions: &[&str] = match dimension {
        Dimension::Relevance => &[
            "Restate the core request before answering",
            "Keep every part of the output tied to the given input",
            "Remove generic content that ignores the input fields",
        ],
        Dimension::Quality => &[
            "Require complete, well-structured output for every field",
            "Add an example of an excellent response",
            "Ask for a final check of accuracy and formatting",
        ],
        Dimension::Creativity => &[
            "Encourage varied vocabulary and sentence structure",
            "Invite a distinctive angle while staying on topic",
            "Discourage stock phrases and boilerplate openings",
        ],
        Dimension::Overall => &[
            "Clarify the goal and audience of the output",
            "Tighten instructions that reviewers repeatedly flag",
        ],
    };
    actions.iter().map(|a| a.to_string()).collect()
}

#[derive(Debug, Deserialize)]
struct ModelWeakness {
    dimension: String,
    #[serde(default)]
    severity: Option<f64>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ModelPriority {
    dimension: String,
    #[serde(default)]
    actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelAnalysis {
    weaknesses: Vec<ModelWeakness>,
    priorities: Vec<ModelPriority>,
}

pub struct FeedbackAnalyzer {
    feedback: Arc<dyn FeedbackStore>,
    generation: Arc<dyn TextGeneration>,
}

impl FeedbackAnalyzer {
    pub fn new(feedback: Arc<dyn FeedbackStore>, generation: Arc<dyn TextGeneration>) -> Self {
        Self {
            feedback,
            generation,
        }
    }

    /// Analyze the feedback of the last `window_days` days.
    ///
    /// An empty window is not an error: it yields a zero summary and no
    /// weaknesses or priorities.
    #[instrument(skip(self))]
    pub async fn analyze_agent_feedback(
        &self,
        subject_id: &str,
        window_days: u32,
    ) -> Result<FeedbackAnalysis> {
        let since = Utc::now() - Duration::days(i64::from(window_days));
        let records = self.feedback.query(subject_id, since).await?;
        let summary = summarize(&records);

        let (weaknesses, priorities, source) = if records.is_empty() {
            (Vec::new(), Vec::new(), AnalysisSource::Empty)
        } else if records.len() >= MODEL_ANALYSIS_MIN_RECORDS {
            match self.model_analysis(&summary).await {
                Some((w, p)) => (w, p, AnalysisSource::Model),
                None => {
                    let (w, p) = heuristic_analysis(&records, &summary);
                    (w, p, AnalysisSource::Heuristic)
                }
            }
        } else {
            let (w, p) = heuristic_analysis(&records, &summary);
            (w, p, AnalysisSource::Heuristic)
        };

        debug!(
            records = records.len(),
            weaknesses = weaknesses.len(),
            source = ?source,
            "feedback analyzed"
        );

        Ok(FeedbackAnalysis {
            subject_id: subject_id.to_string(),
            window_days,
            summary,
            weaknesses,
            priorities,
            source,
            analyzed_at: Utc::now(),
        })
    }

    /// Whether the subject has at least `min_count` records in the default window.
    pub async fn has_enough_feedback(&self, subject_id: &str, min_count: u32) -> Result<bool> {
        let since = Utc::now() - Duration::days(i64::from(DEFAULT_WINDOW_DAYS));
        let count = self.feedback.count(subject_id, since).await?;
        Ok(count >= u64::from(min_count))
    }

    async fn model_analysis(
        &self,
        summary: &FeedbackSummary,
    ) -> Option<(Vec<WeakArea>, Vec<ImprovementPriority>)> {
        let request = GenerationRequest::new(ANALYSIS_SYSTEM_PROMPT, render_summary(summary));
        let response = match self.generation.generate(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "analysis generation failed, using heuristics");
                return None;
            }
        };

        let parsed = match parse_model_output::<ModelAnalysis>(&response.content) {
            ParseOutcome::Parsed(p) => p,
            ParseOutcome::Malformed(reason) => {
                warn!(%reason, "analysis output malformed, using heuristics");
                return None;
            }
        };

        let weaknesses: Vec<WeakArea> = parsed
            .weaknesses
            .into_iter()
            .filter_map(|w| {
                Some(WeakArea {
                    dimension: Dimension::parse(&w.dimension)?,
                    severity: w.severity.unwrap_or(0.5).clamp(0.0, 1.0),
                    description: w.description,
                })
            })
            .collect();
        let priorities: Vec<ImprovementPriority> = parsed
            .priorities
            .into_iter()
            .filter_map(|p| {
                let dimension = Dimension::parse(&p.dimension)?;
                let actions = if p.actions.is_empty() {
                    default_actions(dimension)
                } else {
                    p.actions
                };
                Some((dimension, actions))
            })
            .enumerate()
            .map(|(i, (dimension, actions))| ImprovementPriority {
                rank: i as u32 + 1,
                dimension,
                actions,
            })
            .collect();

        if priorities.is_empty() {
            warn!("analysis output named no known dimensions, using heuristics");
            return None;
        }
        Some((weaknesses, priorities))
    }
}

/// Statistical summary of a reverse-chronological record list.
pub fn summarize(records: &[FeedbackRecord]) -> FeedbackSummary {
    if records.is_empty() {
        return FeedbackSummary::empty();
    }
    let scores: Vec<DimensionScores> = records.iter().map(|r| r.scores).collect();
    let overall: Vec<f64> = scores.iter().map(|s| s.overall).collect();

    FeedbackSummary {
        total: records.len(),
        averages: DimensionScores::mean(&scores),
        distribution: ScoreDistribution::from_scores(&overall),
        top_weaknesses: top_entries(records.iter().flat_map(|r| r.weaknesses.iter())),
        top_strengths: top_entries(records.iter().flat_map(|r| r.strengths.iter())),
        top_suggestions: top_entries(records.iter().flat_map(|r| r.suggestions.iter())),
        trend: trend(&overall),
    }
}

/// Most frequent exact strings, count descending then text ascending.
fn top_entries<'a>(items: impl Iterator<Item = &'a String>) -> Vec<FrequencyEntry> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in items {
        let item = item.trim();
        if !item.is_empty() {
            *counts.entry(item).or_default() += 1;
        }
    }
    let mut entries: Vec<FrequencyEntry> = counts
        .into_iter()
        .map(|(text, count)| FrequencyEntry {
            text: text.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.text.cmp(&b.text)));
    entries.truncate(TOP_N);
    entries
}

/// Newer half versus older half of a newest-first score list.
fn trend(overall_newest_first: &[f64]) -> Trend {
    if overall_newest_first.len() < 2 {
        return Trend::Stable;
    }
    let half = overall_newest_first.len() / 2;
    let (newer, older) = overall_newest_first.split_at(half);
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let delta = mean(newer) - mean(older);
    if delta > TREND_DEAD_BAND {
        Trend::Improving
    } else if delta < -TREND_DEAD_BAND {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// Deterministic weak areas and priorities.
///
/// A detail dimension is weak when more than 30% of records score it below 3.
/// Priorities list every detail dimension, lowest average first.
pub fn heuristic_analysis(
    records: &[FeedbackRecord],
    summary: &FeedbackSummary,
) -> (Vec<WeakArea>, Vec<ImprovementPriority>) {
    if records.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let n = records.len() as f64;

    let weaknesses = Dimension::DETAIL
        .iter()
        .filter_map(|&dimension| {
            let low = records
                .iter()
                .filter(|r| r.scores.get(dimension) < WEAK_SCORE)
                .count() as f64;
            let fraction = low / n;
            (fraction > WEAK_FRACTION).then(|| WeakArea {
                dimension,
                severity: fraction,
                description: format!(
                    "{:.0}% of executions scored {} below {}",
                    fraction * 100.0,
                    dimension,
                    WEAK_SCORE
                ),
            })
        })
        .collect();

    let mut ordered = Dimension::DETAIL.to_vec();
    ordered.sort_by(|a, b| {
        summary
            .averages
            .get(*a)
            .partial_cmp(&summary.averages.get(*b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let priorities = ordered
        .into_iter()
        .enumerate()
        .map(|(i, dimension)| ImprovementPriority {
            rank: i as u32 + 1,
            dimension,
            actions: default_actions(dimension),
        })
        .collect();

    (weaknesses, priorities)
}

fn render_summary(summary: &FeedbackSummary) -> String {
    let a = &summary.averages;
    let d = &summary.distribution;
    let mut out = format!(
        "Feedback records: {}\nAverage scores (0-5): overall {:.2}, relevance {:.2}, quality {:.2}, creativity {:.2}\n\
         Distribution: excellent {:.0}%, good {:.0}%, average {:.0}%, poor {:.0}%, failing {:.0}%\nTrend: {}\n",
        summary.total,
        a.overall,
        a.relevance,
        a.quality,
        a.creativity,
        d.excellent * 100.0,
        d.good * 100.0,
        d.average * 100.0,
        d.poor * 100.0,
        d.failing * 100.0,
        summary.trend.as_str(),
    );
    for (title, entries) in [
        ("Most common weaknesses", &summary.top_weaknesses),
        ("Most common strengths", &summary.top_strengths),
        ("Most common suggestions", &summary.top_suggestions),
    ] {
        if entries.is_empty() {
            continue;
        }
        out.push_str(&format!("{title}:\n"));
        for e in entries {
            out.push_str(&format!("- {} (x{})\n", e.text, e.count));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(overall: f64, relevance: f64, quality: f64, creativity: f64) -> FeedbackRecord {
        FeedbackRecord::new(
            "writer",
            DimensionScores::new(overall, relevance, quality, creativity),
        )
    }

    #[test]
    fn trend_dead_band() {
        assert_eq!(trend(&[]), Trend::Stable);
        assert_eq!(trend(&[5.0]), Trend::Stable);
        assert_eq!(trend(&[4.0, 4.0, 3.0, 3.0]), Trend::Improving);
        assert_eq!(trend(&[3.0, 3.0, 4.0, 4.0]), Trend::Declining);
        assert_eq!(trend(&[3.1, 3.0]), Trend::Stable);
    }

    #[test]
    fn top_entries_counts_and_breaks_ties_by_text() {
        let items: Vec<String> = ["b", "a", "b", "c", "a", "d", "e", "f", "  "]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let top = top_entries(items.iter());
        let texts: Vec<&str> = top.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(top[0].count, 2);
    }

    #[test]
    fn summarize_empty_is_zero() {
        let s = summarize(&[]);
        assert_eq!(s.total, 0);
        assert_eq!(s.distribution.total(), 0.0);
        assert_eq!(s.trend, Trend::Stable);
    }

    #[test]
    fn heuristic_flags_dimensions_over_thirty_percent_low() {
        let now = Utc::now();
        let records: Vec<FeedbackRecord> = (0..10)
            .map(|i| {
                // quality below 3 in 4/10 records; relevance in 3/10 (not > 30%)
                let q = if i < 4 { 2.0 } else { 4.0 };
                let r = if i < 3 { 2.0 } else { 4.5 };
                record(3.5, r, q, 4.0).at(now - Duration::hours(i))
            })
            .collect();
        let summary = summarize(&records);
        let (weak, priorities) = heuristic_analysis(&records, &summary);

        assert_eq!(weak.len(), 1);
        assert_eq!(weak[0].dimension, Dimension::Quality);
        assert!((weak[0].severity - 0.4).abs() < 1e-9);

        let order: Vec<Dimension> = priorities.iter().map(|p| p.dimension).collect();
        assert_eq!(
            order,
            vec![Dimension::Quality, Dimension::Relevance, Dimension::Creativity]
        );
        assert_eq!(priorities[0].rank, 1);
        assert!(!priorities[0].actions.is_empty());
    }
}
