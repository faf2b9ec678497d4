//! Pure comparison rules: summaries, regressions, significance, recommendation.

use evolve_state::{
    CasePair, CaseRun, Dimension, DimensionScores, Recommendation, Regression, TestComparison,
    TestRunSummary,
};

/// Per-case, per-dimension drop that counts as a regression.
pub const REGRESSION_MARGIN: f64 = 0.5;
/// Overall improvement required for an unattended promote recommendation.
pub const PROMOTE_MIN_IMPROVEMENT: f64 = 0.2;
pub const PROMOTE_MIN_PASS_RATE: f64 = 0.8;
/// Baseline case count below which the result is inconclusive.
pub const MIN_CASES: u32 = 5;
/// Largest tolerated pass-rate drop.
pub const MAX_PASS_RATE_DROP: f64 = 0.1;
pub const MAX_REGRESSIONS: usize = 2;

/// Floating-point slack on every threshold decision in comparison, gate
/// evaluation and auto-promotion.
pub const SCORE_TOLERANCE: f64 = 1e-9;

/// `value >= threshold` within [`SCORE_TOLERANCE`].
pub fn at_least(value: f64, threshold: f64) -> bool {
    value >= threshold - SCORE_TOLERANCE
}

/// `value > limit` by more than [`SCORE_TOLERANCE`].
pub fn exceeds(value: f64, limit: f64) -> bool {
    value > limit + SCORE_TOLERANCE
}

pub fn summarize_runs<'a>(runs: impl IntoIterator<Item = &'a CaseRun>) -> TestRunSummary {
    let runs: Vec<&CaseRun> = runs.into_iter().collect();
    let total = runs.len() as u32;
    if total == 0 {
        return TestRunSummary::default();
    }
    let passed = runs.iter().filter(|r| r.passed).count() as u32;
    let scores: Vec<DimensionScores> = runs.iter().map(|r| r.scores).collect();
    TestRunSummary {
        total,
        passed,
        failed: total - passed,
        pass_rate: passed as f64 / total as f64,
        mean_scores: DimensionScores::mean(&scores),
        wall_clock_ms: runs.iter().map(|r| r.latency_ms).sum(),
    }
}

/// Regressions in one case: every dimension where the baseline beats the
/// candidate by more than [`REGRESSION_MARGIN`].
pub fn case_regressions(pair: &CasePair) -> Vec<Regression> {
    Dimension::ALL
        .iter()
        .filter_map(|&dimension| {
            let baseline = pair.baseline.scores.get(dimension);
            let candidate = pair.candidate.scores.get(dimension);
            let magnitude = baseline - candidate;
            exceeds(magnitude, REGRESSION_MARGIN).then(|| Regression {
                case_id: pair.baseline.case_id.clone(),
                case_name: pair.baseline.case_name.clone(),
                dimension,
                baseline,
                candidate,
                magnitude,
            })
        })
        .collect()
}

/// Fixed heuristic, not a statistical test.
pub fn is_significant(cases: u32, improved: u32, worse: u32) -> bool {
    cases >= 5 && improved >= 2 * worse && improved >= 3
}

pub fn compare(
    pairs: &[CasePair],
    baseline: &TestRunSummary,
    candidate: &TestRunSummary,
) -> TestComparison {
    let mut improved = 0;
    let mut worse = 0;
    let mut unchanged = 0;
    let mut regressions = Vec::new();

    for pair in pairs {
        let delta = pair.delta().overall;
        if exceeds(delta, 0.0) {
            improved += 1;
        } else if exceeds(-delta, 0.0) {
            worse += 1;
        } else {
            unchanged += 1;
        }
        regressions.extend(case_regressions(pair));
    }

    TestComparison {
        improvement: candidate.mean_scores.minus(&baseline.mean_scores),
        pass_rate_delta: candidate.pass_rate - baseline.pass_rate,
        improved_cases: improved,
        regressed_cases: worse,
        unchanged_cases: unchanged,
        regressions,
        significant: is_significant(pairs.len() as u32, improved, worse),
    }
}

/// Recommendation rules, first match wins.
pub fn recommend(
    comparison: &TestComparison,
    baseline: &TestRunSummary,
    candidate: &TestRunSummary,
) -> Recommendation {
    let regressions = comparison.regressions.len();
    let improvement = comparison.overall_improvement();

    if regressions > MAX_REGRESSIONS {
        return Recommendation::Reject;
    }
    if exceeds(baseline.pass_rate - candidate.pass_rate, MAX_PASS_RATE_DROP) {
        return Recommendation::Reject;
    }
    if comparison.significant
        && at_least(improvement, PROMOTE_MIN_IMPROVEMENT)
        && regressions == 0
        && at_least(candidate.pass_rate, PROMOTE_MIN_PASS_RATE)
    {
        return Recommendation::Promote;
    }
    if baseline.total < MIN_CASES {
        return Recommendation::MoreTesting;
    }
    if exceeds(improvement, 0.0) && regressions <= 1 {
        return Recommendation::Review;
    }
    Recommendation::Reject
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str, overall: f64, passed: bool) -> CaseRun {
        run_scores(id, DimensionScores::new(overall, overall, overall, overall), passed)
    }

    fn run_scores(id: &str, scores: DimensionScores, passed: bool) -> CaseRun {
        CaseRun {
            case_id: id.to_string(),
            case_name: id.to_string(),
            scores,
            passed,
            output: None,
            error: None,
            latency_ms: 1,
        }
    }

    fn pairs(rows: &[(f64, f64)]) -> Vec<CasePair> {
        rows.iter()
            .enumerate()
            .map(|(i, &(b, c))| CasePair {
                baseline: run(&i.to_string(), b, b >= 3.0),
                candidate: run(&i.to_string(), c, c >= 3.0),
            })
            .collect()
    }

    fn evaluate(p: &[CasePair]) -> (TestComparison, Recommendation) {
        let b = summarize_runs(p.iter().map(|p| &p.baseline));
        let c = summarize_runs(p.iter().map(|p| &p.candidate));
        let cmp = compare(p, &b, &c);
        let rec = recommend(&cmp, &b, &c);
        (cmp, rec)
    }

    #[test]
    fn summary_of_nothing_is_zero() {
        assert_eq!(summarize_runs(std::iter::empty()), TestRunSummary::default());
    }

    #[test]
    fn identical_runs_show_no_change() {
        let (cmp, _) = evaluate(&pairs(&[(3.5, 3.5), (4.0, 4.0), (2.0, 2.0)]));
        assert_eq!(cmp.overall_improvement(), 0.0);
        assert!(cmp.regressions.is_empty());
        assert_eq!(cmp.unchanged_cases, 3);
    }

    #[test]
    fn clear_win_is_promoted() {
        let rows = [(2.5, 3.8), (3.0, 4.2), (2.8, 4.0), (3.1, 4.5), (2.0, 3.5), (3.0, 4.1)];
        let (cmp, rec) = evaluate(&pairs(&rows));
        assert!(cmp.significant);
        assert_eq!(rec, Recommendation::Promote);
    }

    #[test]
    fn promote_pass_rate_tolerates_rounding() {
        let rows = [(2.5, 3.8), (3.0, 4.2), (2.8, 4.0), (3.1, 4.5), (2.0, 3.5), (3.0, 4.1)];
        let p = pairs(&rows);
        let b = summarize_runs(p.iter().map(|p| &p.baseline));
        let mut c = summarize_runs(p.iter().map(|p| &p.candidate));
        let cmp = compare(&p, &b, &c);
        c.pass_rate = 0.7 + 0.1;
        assert!(c.pass_rate < PROMOTE_MIN_PASS_RATE);
        assert_eq!(recommend(&cmp, &b, &c), Recommendation::Promote);
    }

    #[test]
    fn three_regressions_reject() {
        let p = vec![CasePair {
            baseline: run_scores("a", DimensionScores::new(4.0, 4.0, 4.0, 4.0), true),
            candidate: run_scores("a", DimensionScores::new(4.2, 3.0, 3.0, 3.0), true),
        }];
        let (cmp, rec) = evaluate(&p);
        assert_eq!(cmp.regressions.len(), 3);
        assert_eq!(rec, Recommendation::Reject);
    }

    #[test]
    fn pass_rate_drop_rejects() {
        let (_, rec) = evaluate(&pairs(&[(3.2, 4.5), (3.2, 4.5), (3.2, 2.9), (3.2, 2.9), (3.2, 4.5)]));
        let (cmp, _) = evaluate(&pairs(&[(3.2, 2.9)]));
        assert!(cmp.regressions.is_empty());
        assert_eq!(rec, Recommendation::Reject);
    }

    #[test]
    fn small_suite_needs_more_testing() {
        let (_, rec) = evaluate(&pairs(&[(3.0, 3.4), (3.0, 3.4)]));
        assert_eq!(rec, Recommendation::MoreTesting);
    }

    #[test]
    fn modest_gain_goes_to_review() {
        let rows = [(3.0, 3.2), (3.0, 3.2), (3.0, 3.0), (3.0, 3.0), (3.0, 3.0)];
        let (cmp, rec) = evaluate(&pairs(&rows));
        assert!(!cmp.significant);
        assert_eq!(rec, Recommendation::Review);
    }

    #[test]
    fn significance_thresholds() {
        assert!(is_significant(5, 3, 1));
        assert!(!is_significant(4, 4, 0));
        assert!(!is_significant(6, 2, 0));
        assert!(!is_significant(9, 4, 3));
    }
}
