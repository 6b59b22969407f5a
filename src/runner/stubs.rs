use std::time::Duration;

use tokio::sync::mpsc::Sender;

use crate::{
    domain::{Language, ResourcePolicy},
    runner::traits::{OutputChunk, RunResult, Runner, RunnerError},
};

/// Canned runner for service and coordinator tests: emits the configured
/// chunks, sleeps for `delay`, then returns the configured result.
#[derive(Debug, Clone)]
pub struct RunnerStub {
    result: Result<RunResult, RunnerError>,
    chunks: Vec<OutputChunk>,
    delay: Duration,
}

impl RunnerStub {
    pub fn new(result: Result<RunResult, RunnerError>, delay: Duration) -> Self {
        Self {
            result,
            chunks: Vec::new(),
            delay,
        }
    }

    pub fn with_chunks(mut self, chunks: Vec<OutputChunk>) -> Self {
        self.chunks = chunks;
        self
    }
}

#[async_trait::async_trait]
impl Runner for RunnerStub {
    #[tracing::instrument(skip(output))]
    async fn run(
        &self,
        code: &str,
        language: Language,
        policy: &ResourcePolicy,
        output: Sender<OutputChunk>,
    ) -> Result<RunResult, RunnerError> {
        tracing::debug!(
            "Start execution: code={:?}, language={:?}, policy={:?}",
            code,
            language,
            policy
        );

        for chunk in &self.chunks {
            output.send(chunk.clone()).await.ok();
        }
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone()
    }
}
