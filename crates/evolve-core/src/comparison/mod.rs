//! Comparative A/B testing of a candidate instruction set against production.
//!
//! Both variants run the same test cases; each run renders the case input
//! into the variant's first template, calls the model, parses the output
//! tolerantly and scores it. A failure in one variant's run for one case is
//! recorded on that run only.

pub mod compare;
pub mod executor;
pub mod gates;
pub mod scoring;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use evolve_state::{AbTestResult, CasePair, CaseRun, InstructionSet, TestCase, TestCaseStore};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::domain::Result;
use crate::generation::{GenerationRequest, TextGeneration};
use crate::parse::{parse_model_output, ParseOutcome};

pub use compare::{compare, is_significant, recommend, summarize_runs};
pub use executor::{BoundedParallelExecutor, CaseExecutor, CaseJob, SequentialExecutor};
pub use gates::evaluate_results;
pub use scoring::{CriteriaScorer, OutputScorer};

/// Substitute a case input into a template body.
///
/// `{{key}}` and `{key}` are replaced by the matching top-level input field
/// (strings verbatim, anything else as JSON) and `{{input}}` by the whole
/// input. When nothing was substituted the input is appended as JSON.
pub fn render_template(body: &str, input: &Value) -> String {
    let mut rendered = body.to_string();
    let input_json = serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string());

    if let Value::Object(fields) = input {
        for (key, value) in fields {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered
                .replace(&format!("{{{{{key}}}}}"), &text)
                .replace(&format!("{{{key}}}"), &text);
        }
    }
    rendered = rendered.replace("{{input}}", &input_json);

    if rendered == body {
        rendered.push_str("\n\nInput:\n");
        rendered.push_str(&input_json);
    }
    rendered
}

pub struct ComparativeTestRunner {
    generation: Arc<dyn TextGeneration>,
    test_cases: Arc<dyn TestCaseStore>,
    scorer: Arc<dyn OutputScorer>,
    executor: Arc<dyn CaseExecutor>,
}

impl ComparativeTestRunner {
    pub fn new(generation: Arc<dyn TextGeneration>, test_cases: Arc<dyn TestCaseStore>) -> Self {
        Self {
            generation,
            test_cases,
            scorer: Arc::new(CriteriaScorer),
            executor: Arc::new(SequentialExecutor),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn OutputScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CaseExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Run `baseline` and `candidate` over the test suite and compare them.
    ///
    /// Without explicit `test_cases` the subject's active suite is loaded,
    /// highest priority first. An empty suite gives [`AbTestResult::empty`].
    #[instrument(skip(self, baseline, candidate, test_cases))]
    pub async fn run_comparison(
        &self,
        subject_id: &str,
        baseline: &InstructionSet,
        candidate: &InstructionSet,
        test_cases: Option<Vec<TestCase>>,
    ) -> Result<AbTestResult> {
        let cases = match test_cases {
            Some(cases) => cases,
            None => self.test_cases.list_active(subject_id).await?,
        };
        if cases.is_empty() {
            info!(subject_id, "no active test cases, comparison inconclusive");
            return Ok(AbTestResult::empty());
        }

        let jobs: Vec<CaseJob<'_>> = cases
            .iter()
            .map(|case| {
                async move {
                    let baseline = self.run_case(baseline, case).await;
                    let candidate = self.run_case(candidate, case).await;
                    CasePair {
                        baseline,
                        candidate,
                    }
                }
                .boxed()
            })
            .collect();
        let pairs = self.executor.run(jobs).await;

        let baseline_summary = summarize_runs(pairs.iter().map(|p| &p.baseline));
        let candidate_summary = summarize_runs(pairs.iter().map(|p| &p.candidate));
        let comparison = compare(&pairs, &baseline_summary, &candidate_summary);
        let recommendation = recommend(&comparison, &baseline_summary, &candidate_summary);

        info!(
            cases = pairs.len(),
            improvement = comparison.overall_improvement(),
            regressions = comparison.regressions.len(),
            %recommendation,
            "comparison finished"
        );

        Ok(AbTestResult {
            baseline: baseline_summary,
            candidate: candidate_summary,
            cases: pairs,
            comparison,
            recommendation,
            executed_at: Utc::now(),
        })
    }

    /// One variant, one case. Never fails: problems become a failed run.
    async fn run_case(&self, set: &InstructionSet, case: &TestCase) -> CaseRun {
        let started = Instant::now();
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        let Some(template) = set.first_template() else {
            return CaseRun::failed(
                &case.case_id,
                &case.name,
                "instruction set has no templates",
                0,
            );
        };
        let request = GenerationRequest::new(
            set.system_text.clone(),
            render_template(&template.body, &case.input),
        )
        .with_options(set.model_options.clone());

        let response = match self.generation.generate(request).await {
            Ok(r) => r,
            Err(e) => {
                debug!(case = %case.name, error = %e, "variant run failed");
                return CaseRun::failed(
                    &case.case_id,
                    &case.name,
                    e.to_string(),
                    elapsed(started),
                );
            }
        };

        let output = match parse_model_output::<Value>(&response.content) {
            ParseOutcome::Parsed(v) => v,
            ParseOutcome::Malformed(reason) => {
                debug!(case = %case.name, %reason, "variant output unparseable");
                return CaseRun::failed(
                    &case.case_id,
                    &case.name,
                    format!("unparseable output: {reason}"),
                    elapsed(started),
                );
            }
        };

        let scores = self.scorer.score(case, &output);
        CaseRun {
            case_id: case.case_id.clone(),
            case_name: case.name.clone(),
            passed: case.min_scores.is_met_by(&scores),
            scores,
            output: Some(output),
            error: None,
            latency_ms: elapsed(started),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_substitutes_both_brace_styles() {
        let out = render_template(
            "Write about {{product}} for {audience}.",
            &json!({"product": "sourdough", "audience": "bakers"}),
        );
        assert_eq!(out, "Write about sourdough for bakers.");
    }

    #[test]
    fn render_inlines_whole_input() {
        let out = render_template("Data: {{input}}", &json!({"n": 2}));
        assert!(out.starts_with("Data: {"));
        assert!(out.contains("\"n\": 2"));
    }

    #[test]
    fn render_appends_input_when_no_placeholder() {
        let out = render_template("Describe the product.", &json!({"product": "rye"}));
        assert!(out.starts_with("Describe the product.\n\nInput:\n"));
        assert!(out.contains("\"rye\""));
    }

    #[test]
    fn render_leaves_json_examples_alone() {
        let out = render_template(
            "Tell me about {{topic}}. Reply as {\"topic\": \"...\"}",
            &json!({"topic": "yeast"}),
        );
        assert_eq!(out, "Tell me about yeast. Reply as {\"topic\": \"...\"}");
    }
}
