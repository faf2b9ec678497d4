//! Analyzer, generator and comparative runner against scripted generation.

use std::sync::Arc;

use evolve_core::feedback_analyzer::summarize;
use evolve_core::{
    AnalysisSource, BoundedParallelExecutor, CandidateGenerator, ComparativeTestRunner, Dimension,
    DimensionScores, ExpectedCriteria, FeedbackAnalyzer, FeedbackRecord, GenerationError,
    GenerationRequest, InstructionSet, Recommendation, ScriptedGeneration, TestCase,
};
use evolve_state::fakes::{MemoryFeedbackStore, MemoryTestCaseStore};
use evolve_state::{FeedbackStore, TestCaseStore};
use serde_json::json;

const SUBJECT: &str = "blurb-writer";

fn production() -> InstructionSet {
    InstructionSet::new("You write product blurbs.")
        .with_template(
            "blurb",
            r#"Write a blurb for {{product}}. Reply as {"title": "...", "body": "..."}"#,
        )
        .with_template("tagline", r#"One line for {{product}}: {"tagline": "..."}"#)
}

/// Blurb that names the product found in the rendered prompt.
fn echo(user: &str) -> String {
    let product = ["rye", "spelt", "sourdough", "brioche", "focaccia"]
        .into_iter()
        .find(|p| user.contains(p))
        .unwrap_or("bread");
    json!({
        "title": product,
        "body": format!("Fresh {product} baked daily with stoneground flour and patience.")
    })
    .to_string()
}

fn echo_generation() -> ScriptedGeneration {
    ScriptedGeneration::new(|req: &GenerationRequest| Ok(echo(&req.user)))
}

fn cases() -> Vec<TestCase> {
    ["rye", "spelt", "sourdough", "brioche", "focaccia"]
        .iter()
        .enumerate()
        .map(|(i, product)| {
            TestCase::new(SUBJECT, format!("case-{product}"), json!({"product": product}))
                .with_expected(ExpectedCriteria {
                    required_fields: vec!["title".into(), "body".into()],
                    keywords: vec![product.to_string()],
                    ..Default::default()
                })
                .with_priority(i as i32)
        })
        .collect()
}

fn runner(generation: ScriptedGeneration) -> ComparativeTestRunner {
    ComparativeTestRunner::new(Arc::new(generation), Arc::new(MemoryTestCaseStore::new()))
}

#[tokio::test]
async fn identical_candidate_shows_no_change() {
    let set = production();
    let result = runner(echo_generation())
        .run_comparison(SUBJECT, &set, &set, Some(cases()))
        .await
        .unwrap();

    assert_eq!(result.baseline.total, 5);
    assert_eq!(result.comparison.overall_improvement(), 0.0);
    assert!(result.comparison.regressions.is_empty());
    assert_eq!(result.comparison.unchanged_cases, 5);
    assert!(!result.comparison.significant);
    assert_eq!(result.recommendation, Recommendation::Reject);
}

#[tokio::test]
async fn empty_suite_needs_more_testing() {
    let set = production();
    let generation = echo_generation();
    let store = Arc::new(MemoryTestCaseStore::new());
    store
        .upsert(TestCase::new(SUBJECT, "retired", json!({})).inactive())
        .await
        .unwrap();
    let runner = ComparativeTestRunner::new(Arc::new(generation), store);

    let result = runner.run_comparison(SUBJECT, &set, &set, None).await.unwrap();

    assert_eq!(result.recommendation, Recommendation::MoreTesting);
    assert_eq!(result.baseline.total, 0);
    assert!(result.cases.is_empty());
}

#[tokio::test]
async fn suite_is_loaded_from_store_by_priority() {
    let store = Arc::new(MemoryTestCaseStore::new());
    for case in cases() {
        store.upsert(case).await.unwrap();
    }
    let runner = ComparativeTestRunner::new(Arc::new(echo_generation()), store);
    let set = production();

    let result = runner.run_comparison(SUBJECT, &set, &set, None).await.unwrap();

    let names: Vec<&str> = result
        .cases
        .iter()
        .map(|p| p.baseline.case_name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["case-focaccia", "case-brioche", "case-sourdough", "case-spelt", "case-rye"]
    );
}

#[tokio::test]
async fn candidate_failures_stay_with_the_candidate() {
    let baseline = production();
    let candidate = InstructionSet::new("Broken candidate system text")
        .with_template("blurb", "Write about {{product}}")
        .with_template("tagline", "x");
    let generation = ScriptedGeneration::new(|req: &GenerationRequest| {
        if req.system.starts_with("Broken") {
            Err(GenerationError::Status {
                status: 503,
                body: "overloaded".into(),
            })
        } else {
            Ok(echo(&req.user))
        }
    });

    let result = runner(generation)
        .run_comparison(SUBJECT, &baseline, &candidate, Some(cases()))
        .await
        .unwrap();

    assert_eq!(result.baseline.passed, 5);
    assert_eq!(result.candidate.passed, 0);
    assert!(result
        .cases
        .iter()
        .all(|p| p.candidate.error.as_deref().unwrap_or("").contains("503")));
    assert_eq!(result.recommendation, Recommendation::Reject);
}

#[tokio::test]
async fn parallel_executor_matches_sequential() {
    let set = production();
    let other = InstructionSet::new("You write terse blurbs.")
        .with_template("blurb", "{{product}}")
        .with_template("tagline", "{{product}}");

    let sequential = runner(echo_generation())
        .run_comparison(SUBJECT, &set, &other, Some(cases()))
        .await
        .unwrap();
    let parallel = runner(echo_generation())
        .with_executor(Arc::new(BoundedParallelExecutor::new(3)))
        .run_comparison(SUBJECT, &set, &other, Some(cases()))
        .await
        .unwrap();

    assert_eq!(sequential.recommendation, parallel.recommendation);
    assert_eq!(sequential.comparison.improvement, parallel.comparison.improvement);
    let ids = |r: &evolve_core::AbTestResult| -> Vec<String> {
        r.cases.iter().map(|p| p.baseline.case_id.clone()).collect()
    };
    assert_eq!(ids(&sequential), ids(&parallel));
}

fn generator_reply() -> String {
    json!({
        "rationale": "Tighter structure",
        "targets": ["quality"],
        "candidates": [
            {
                "system_text": "You write product blurbs with a concrete sensory detail in every sentence.",
                "templates": {
                    "blurb": "Write a blurb for {{product}}. Reply as {\"title\": \"...\", \"body\": \"...\"}"
                },
                "rationale": "Only rewrites the blurb template and forgets the tagline"
            },
            {
                "system_text": "You write product blurbs that open with the product name and stay factual.",
                "templates": {
                    "tagline": "A short line for {{product}}: {\"tagline\": \"...\"}",
                    "blurb": "Blurb for {{product}}. Reply as {\"headline\": \"...\", \"body\": \"...\"}"
                },
                "rationale": "Leads with the product name"
            }
        ]
    })
    .to_string()
}

fn analysis() -> evolve_core::FeedbackAnalysis {
    let records = vec![FeedbackRecord::new(SUBJECT, DimensionScores::new(2.0, 2.0, 2.0, 2.0))];
    let summary = summarize(&records);
    let (weaknesses, priorities) =
        evolve_core::feedback_analyzer::heuristic_analysis(&records, &summary);
    evolve_core::FeedbackAnalysis {
        subject_id: SUBJECT.to_string(),
        window_days: 30,
        summary,
        weaknesses,
        priorities,
        source: AnalysisSource::Heuristic,
        analyzed_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn candidates_missing_a_template_are_dropped() {
    let generation = Arc::new(ScriptedGeneration::always(generator_reply()));
    let generator = CandidateGenerator::new(generation.clone());

    let outcome = generator
        .generate_candidates(&production(), &analysis(), 3)
        .await;

    assert_eq!(generation.calls(), 1);
    assert_eq!(outcome.candidates.len(), 1);
    assert_eq!(outcome.rejected.len(), 1);
    let kept = &outcome.candidates[0];
    assert_eq!(kept.instruction_set.template_names(), vec!["blurb", "tagline"]);
    assert!(kept.warnings.iter().any(|w| w.contains("\"title\"")));
    assert_eq!(outcome.targets, vec![Dimension::Quality]);

    let prompt = &generation.requests()[0].user;
    assert!(prompt.contains("OUTPUT FIELD NAMES THAT MUST NOT CHANGE"));
    assert!(prompt.contains("tagline"));
}

#[tokio::test]
async fn badly_typed_candidate_does_not_sink_its_siblings() {
    let reply = json!({
        "candidates": [
            {
                "system_text": "You write product blurbs and always mention the product by its exact name.",
                "templates": {
                    "blurb": "Blurb for {{product}}: {\"title\": \"\", \"body\": \"\"}",
                    "tagline": "Line for {{product}}: {\"tagline\": \"\"}"
                },
                "rationale": "Names the product explicitly for relevance"
            },
            {
                "system_text": "You write product blurbs that restate the product name in the first sentence.",
                "templates": {"blurb": null, "tagline": "Tag {{product}}: {\"tagline\": \"\"}"},
                "rationale": "Restates the product name early on"
            }
        ]
    })
    .to_string();
    let generator = CandidateGenerator::new(Arc::new(ScriptedGeneration::always(reply)));

    let outcome = generator
        .generate_candidates(&production(), &analysis(), 3)
        .await;

    assert_eq!(outcome.candidates.len(), 1);
    assert_eq!(outcome.rejected.len(), 1);
    assert!(outcome.rejected[0].starts_with("candidate 1: malformed"));
    assert!(outcome.candidates[0]
        .instruction_set
        .system_text
        .contains("exact name"));
}

#[tokio::test]
async fn generation_failure_yields_empty_outcome() {
    let generator = CandidateGenerator::new(Arc::new(ScriptedGeneration::failing()));

    let outcome = generator
        .generate_candidates(&production(), &analysis(), 3)
        .await;

    assert!(outcome.candidates.is_empty());
    assert!(outcome.rationale.contains("generation call failed"));
    assert!(!outcome.targets.is_empty());
}

#[tokio::test]
async fn focused_improvement_returns_one_candidate() {
    let reply = json!({
        "candidates": [
            {
                "system_text": "You write product blurbs and always mention the product by its exact name.",
                "templates": {
                    "blurb": "Blurb for {{product}}: {\"title\": \"\", \"body\": \"\"}",
                    "tagline": "Line for {{product}}: {\"tagline\": \"\"}"
                },
                "rationale": "Names the product explicitly for relevance"
            },
            {
                "system_text": "You write product blurbs that restate the product name in the first sentence.",
                "templates": {
                    "blurb": "About {{product}}: {\"title\": \"\", \"body\": \"\"}",
                    "tagline": "Tag {{product}}: {\"tagline\": \"\"}"
                },
                "rationale": "Restates the product name early on"
            }
        ]
    })
    .to_string();
    let generation = Arc::new(ScriptedGeneration::always(reply));
    let generator = CandidateGenerator::new(generation.clone());

    let outcome = generator
        .generate_focused_improvement(&production(), Dimension::Relevance, "ignores the product")
        .await;

    assert_eq!(outcome.candidates.len(), 1);
    assert_eq!(outcome.targets, vec![Dimension::Relevance]);
    assert!(generation.requests()[0].user.contains("ignores the product"));
}

#[tokio::test]
async fn feedback_threshold_is_inclusive() {
    let store = Arc::new(MemoryFeedbackStore::new());
    for _ in 0..9 {
        store
            .record(FeedbackRecord::new(SUBJECT, DimensionScores::new(4.0, 4.0, 4.0, 4.0)))
            .await
            .unwrap();
    }
    let analyzer = FeedbackAnalyzer::new(store.clone(), Arc::new(ScriptedGeneration::failing()));
    assert!(!analyzer.has_enough_feedback(SUBJECT, 10).await.unwrap());

    store
        .record(FeedbackRecord::new(SUBJECT, DimensionScores::new(4.0, 4.0, 4.0, 4.0)))
        .await
        .unwrap();
    assert!(analyzer.has_enough_feedback(SUBJECT, 10).await.unwrap());
}

#[tokio::test]
async fn analysis_falls_back_to_heuristics_when_model_fails() {
    let store = Arc::new(MemoryFeedbackStore::new());
    for i in 0..6 {
        let quality = if i % 2 == 0 { 1.5 } else { 2.5 };
        store
            .record(
                FeedbackRecord::new(SUBJECT, DimensionScores::new(3.0, 4.0, quality, 4.0))
                    .with_weakness("flat wording"),
            )
            .await
            .unwrap();
    }
    let generation = Arc::new(ScriptedGeneration::failing());
    let analyzer = FeedbackAnalyzer::new(store, generation.clone());

    let analysis = analyzer.analyze_agent_feedback(SUBJECT, 30).await.unwrap();

    assert_eq!(generation.calls(), 1);
    assert_eq!(analysis.source, AnalysisSource::Heuristic);
    assert_eq!(analysis.weaknesses.len(), 1);
    assert_eq!(analysis.weaknesses[0].dimension, Dimension::Quality);
    assert_eq!(analysis.priorities[0].dimension, Dimension::Quality);
    assert!((analysis.summary.distribution.total() - 1.0).abs() < 1e-6);
    assert_eq!(analysis.summary.top_weaknesses[0].count, 6);
}

#[tokio::test]
async fn empty_window_is_not_an_error() {
    let generation = Arc::new(ScriptedGeneration::failing());
    let analyzer = FeedbackAnalyzer::new(Arc::new(MemoryFeedbackStore::new()), generation.clone());

    let analysis = analyzer.analyze_agent_feedback(SUBJECT, 30).await.unwrap();

    assert_eq!(analysis.summary.total, 0);
    assert_eq!(analysis.summary.distribution.total(), 0.0);
    assert!(analysis.weaknesses.is_empty());
    assert!(analysis.priorities.is_empty());
    assert_eq!(generation.calls(), 0);
}
