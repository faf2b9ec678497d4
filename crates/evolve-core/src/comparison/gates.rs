//! Quality gates applied to a finished comparison.

use evolve_state::{
    AbTestResult, GateCheck, GateKind, QualityGateResult, QualityGates, Recommendation,
};

use super::compare::{at_least, exceeds};

const BASE_CONFIDENCE: f64 = 0.5;
const GATE_SHARE_WEIGHT: f64 = 0.2;
const SIGNIFICANCE_BONUS: f64 = 0.15;
const NO_REGRESSION_BONUS: f64 = 0.10;
const HIGH_PASS_RATE_BONUS: f64 = 0.05;
const HIGH_PASS_RATE: f64 = 0.9;

/// Check each gate independently and adjust the recommendation.
///
/// A `promote` recommendation is downgraded to `review` when any gate fails;
/// other recommendations pass through unchanged.
pub fn evaluate_results(result: &AbTestResult, gates: &QualityGates) -> QualityGateResult {
    let comparison = &result.comparison;
    let improvement = comparison.overall_improvement();
    let max_regression = comparison.max_regression();
    let pass_rate = result.candidate.pass_rate;

    let checks = vec![
        GateCheck {
            gate: GateKind::MinImprovementThreshold,
            passed: at_least(improvement, gates.min_improvement_threshold),
            actual: improvement,
            threshold: gates.min_improvement_threshold,
            message: format!(
                "overall improvement {improvement:+.2} (needs >= {:.2})",
                gates.min_improvement_threshold
            ),
        },
        GateCheck {
            gate: GateKind::MaxRegressionAllowed,
            passed: !exceeds(max_regression, gates.max_regression_allowed),
            actual: max_regression,
            threshold: gates.max_regression_allowed,
            message: format!(
                "largest regression {max_regression:.2} (allowed <= {:.2})",
                gates.max_regression_allowed
            ),
        },
        GateCheck {
            gate: GateKind::MinTestPassRate,
            passed: at_least(pass_rate, gates.min_test_pass_rate),
            actual: pass_rate,
            threshold: gates.min_test_pass_rate,
            message: format!(
                "candidate pass rate {:.0}% (needs >= {:.0}%)",
                pass_rate * 100.0,
                gates.min_test_pass_rate * 100.0
            ),
        },
    ];

    let passed_count = checks.iter().filter(|c| c.passed).count();
    let passed = passed_count == checks.len();

    let mut confidence =
        BASE_CONFIDENCE + GATE_SHARE_WEIGHT * passed_count as f64 / checks.len() as f64;
    if comparison.significant {
        confidence += SIGNIFICANCE_BONUS;
    }
    if comparison.regressions.is_empty() {
        confidence += NO_REGRESSION_BONUS;
    }
    if at_least(pass_rate, HIGH_PASS_RATE) {
        confidence += HIGH_PASS_RATE_BONUS;
    }

    let recommendation = match result.recommendation {
        Recommendation::Promote if !passed => Recommendation::Review,
        other => other,
    };

    QualityGateResult {
        passed,
        checks,
        recommendation,
        confidence: confidence.min(1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolve_state::{Dimension, DimensionScores, Regression};

    fn result(improvement: f64, pass_rate: f64, rec: Recommendation) -> AbTestResult {
        let mut r = AbTestResult::empty();
        r.comparison.improvement = DimensionScores::new(improvement, 0.0, 0.0, 0.0);
        r.candidate.pass_rate = pass_rate;
        r.recommendation = rec;
        r
    }

    #[test]
    fn all_gates_pass_keeps_promote() {
        let mut r = result(0.5, 1.0, Recommendation::Promote);
        r.comparison.significant = true;
        let g = evaluate_results(&r, &QualityGates::default());
        assert!(g.passed);
        assert_eq!(g.recommendation, Recommendation::Promote);
        assert!((g.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn failed_gate_downgrades_promote() {
        let r = result(0.05, 1.0, Recommendation::Promote);
        let g = evaluate_results(&r, &QualityGates::default());
        assert!(!g.passed);
        assert_eq!(g.failed_gates(), vec![GateKind::MinImprovementThreshold]);
        assert_eq!(g.recommendation, Recommendation::Review);
        // 0.5 + 0.2 * 2/3 + 0.10 + 0.05
        assert!((g.confidence - (0.65 + 0.4 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn large_regression_fails_its_gate() {
        let mut r = result(0.5, 0.85, Recommendation::Review);
        r.comparison.regressions.push(Regression {
            case_id: "c".into(),
            case_name: "c".into(),
            dimension: Dimension::Quality,
            baseline: 4.5,
            candidate: 2.5,
            magnitude: 2.0,
        });
        let g = evaluate_results(&r, &QualityGates::default());
        assert_eq!(g.failed_gates(), vec![GateKind::MaxRegressionAllowed]);
        assert_eq!(g.recommendation, Recommendation::Review);
    }

    #[test]
    fn reject_is_not_upgraded() {
        let r = result(1.0, 1.0, Recommendation::Reject);
        let g = evaluate_results(&r, &QualityGates::default());
        assert!(g.passed);
        assert_eq!(g.recommendation, Recommendation::Reject);
    }

    #[test]
    fn thresholds_tolerate_rounding() {
        let r = result(0.7 - 0.4, 0.7 + 0.1, Recommendation::Review);
        let gates = QualityGates {
            min_improvement_threshold: 0.3,
            max_regression_allowed: 0.0,
            min_test_pass_rate: 0.8,
        };
        assert!(r.comparison.overall_improvement() < 0.3);
        assert!(r.candidate.pass_rate < 0.8);
        let g = evaluate_results(&r, &gates);
        assert!(g.passed, "{:?}", g.failed_gates());
    }
}
