use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::constants::{
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_TIMEOUT_SECONDS,
};

/// Per-execution resource ceilings. Immutable once attached to an Execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
    pub max_output_bytes: u64,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
}

impl ResourcePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.timeout_seconds == 0 {
            return Err(PolicyError::NotPositive {
                field: "timeout_seconds",
            });
        }
        if self.memory_limit_mb == 0 {
            return Err(PolicyError::NotPositive {
                field: "memory_limit_mb",
            });
        }
        if self.max_output_bytes == 0 {
            return Err(PolicyError::NotPositive {
                field: "max_output_bytes",
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Language {
    Python,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    MemoryExceeded,
    Killed,
}

impl ExecutionState {
    /// Terminal states are absorbing: no further transition, no further
    /// output mutation.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Queued | ExecutionState::Running)
    }
}

/// One submitted code run and its tracked lifecycle/result. Owned by the
/// coordinator; the runner only ever sees the code and the policy.
#[derive(Clone, Debug)]
pub struct Execution {
    pub id: Uuid,
    pub code: String,
    pub language: Language,
    pub policy: ResourcePolicy,
    pub state: ExecutionState,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub exec_time_sec: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(code: String, language: Language, policy: ResourcePolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            language,
            policy,
            state: ExecutionState::Queued,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            exec_time_sec: None,
            memory_used_mb: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
