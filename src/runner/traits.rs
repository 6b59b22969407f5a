use tokio::sync::mpsc::Sender;

use crate::domain::{Language, ResourcePolicy};

/// Raw outcome of one run, before the formatter applies the output ceiling.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub exec_time_sec: f64,
    pub memory_used_mb: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitKind {
    CpuTime,
    Memory,
}

/// Limit violations carry the partial result; they are terminal
/// classifications for the coordinator, not errors to recover from. The
/// runner never retries.
#[derive(Debug, Clone)]
pub enum RunnerError {
    LimitsExceeded { result: RunResult, limit: LimitKind },
    FailedToLaunch { msg: String },
}

/// A piece of child output forwarded while the run is still in flight, so
/// the coordinator can serve partial logs.
#[derive(Clone, Debug)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

#[async_trait::async_trait]
pub trait Runner: std::fmt::Debug + Send + Sync {
    async fn run(
        &self,
        code: &str,
        language: Language,
        policy: &ResourcePolicy,
        output: Sender<OutputChunk>,
    ) -> Result<RunResult, RunnerError>;
}
