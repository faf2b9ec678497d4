//! Feedback analysis types.

use chrono::{DateTime, Utc};
use evolve_state::{Dimension, DimensionScores};
use serde::{Deserialize, Serialize};

/// Fraction of records per overall-score bucket.
///
/// Sums to 1 when there is at least one record, all zeros otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    /// ≥ 4.5
    pub excellent: f64,
    /// ≥ 3.5
    pub good: f64,
    /// ≥ 2.5
    pub average: f64,
    /// ≥ 1.5
    pub poor: f64,
    /// < 1.5
    pub failing: f64,
}

impl ScoreDistribution {
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        let mut counts = [0usize; 5];
        for &s in scores {
            let bucket = if s >= 4.5 {
                0
            } else if s >= 3.5 {
                1
            } else if s >= 2.5 {
                2
            } else if s >= 1.5 {
                3
            } else {
                4
            };
            counts[bucket] += 1;
        }
        let n = scores.len() as f64;
        Self {
            excellent: counts[0] as f64 / n,
            good: counts[1] as f64 / n,
            average: counts[2] as f64 / n,
            poor: counts[3] as f64 / n,
            failing: counts[4] as f64 / n,
        }
    }

    pub fn total(&self) -> f64 {
        self.excellent + self.good + self.average + self.poor + self.failing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Improving => "improving",
            Trend::Stable => "stable",
            Trend::Declining => "declining",
        }
    }
}

/// A free-text entry and how often it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyEntry {
    pub text: String,
    pub count: usize,
}

/// Statistical view of a feedback window. Recomputed every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub total: usize,
    pub averages: DimensionScores,
    pub distribution: ScoreDistribution,
    pub top_weaknesses: Vec<FrequencyEntry>,
    pub top_strengths: Vec<FrequencyEntry>,
    pub top_suggestions: Vec<FrequencyEntry>,
    pub trend: Trend,
}

impl FeedbackSummary {
    pub fn empty() -> Self {
        Self {
            total: 0,
            averages: DimensionScores::default(),
            distribution: ScoreDistribution::default(),
            top_weaknesses: Vec::new(),
            top_strengths: Vec::new(),
            top_suggestions: Vec::new(),
            trend: Trend::Stable,
        }
    }
}

/// A dimension the subject underperforms on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakArea {
    pub dimension: Dimension,
    /// 0–1; higher is worse.
    pub severity: f64,
    pub description: String,
}

/// What to work on, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementPriority {
    /// 1 = most urgent.
    pub rank: u32,
    pub dimension: Dimension,
    pub actions: Vec<String>,
}

/// Where the weakness/priority analysis came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    /// No feedback in the window.
    Empty,
    /// Extracted by the text-generation model.
    Model,
    /// Deterministic threshold rules.
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackAnalysis {
    pub subject_id: String,
    pub window_days: u32,
    pub summary: FeedbackSummary,
    pub weaknesses: Vec<WeakArea>,
    pub priorities: Vec<ImprovementPriority>,
    pub source: AnalysisSource,
    pub analyzed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        let d = ScoreDistribution::from_scores(&[4.5, 3.5, 2.5, 1.5, 1.49]);
        assert_eq!(d.excellent, 0.2);
        assert_eq!(d.good, 0.2);
        assert_eq!(d.average, 0.2);
        assert_eq!(d.poor, 0.2);
        assert_eq!(d.failing, 0.2);
    }

    #[test]
    fn distribution_sums_to_one_or_zero() {
        assert_eq!(ScoreDistribution::from_scores(&[]).total(), 0.0);
        for n in 1..40 {
            let scores: Vec<f64> = (0..n).map(|i| (i % 11) as f64 * 0.5).collect();
            let total = ScoreDistribution::from_scores(&scores).total();
            assert!((total - 1.0).abs() < 1e-6, "n={n} total={total}");
        }
    }
}
