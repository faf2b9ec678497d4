//! How per-case jobs are driven.
//!
//! A comparison builds one future per test case (baseline run, then
//! candidate run) and hands the list to a [`CaseExecutor`]. Executors must
//! return results in input order.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

use evolve_state::CasePair;

/// One test case, both variants.
pub type CaseJob<'a> = BoxFuture<'a, CasePair>;

#[async_trait]
pub trait CaseExecutor: Send + Sync {
    async fn run<'a>(&self, jobs: Vec<CaseJob<'a>>) -> Vec<CasePair>;
}

/// Runs cases one after another.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

#[async_trait]
impl CaseExecutor for SequentialExecutor {
    async fn run<'a>(&self, jobs: Vec<CaseJob<'a>>) -> Vec<CasePair> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            results.push(job.await);
        }
        results
    }
}

/// Runs up to `limit` cases concurrently, preserving case order.
#[derive(Debug, Clone, Copy)]
pub struct BoundedParallelExecutor {
    limit: usize,
}

impl BoundedParallelExecutor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl CaseExecutor for BoundedParallelExecutor {
    async fn run<'a>(&self, jobs: Vec<CaseJob<'a>>) -> Vec<CasePair> {
        stream::iter(jobs).buffered(self.limit).collect().await
    }
}
