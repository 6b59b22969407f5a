use uuid::Uuid;

use crate::domain;
use crate::grpc::models;
use crate::runner::traits::OutputChunk;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("malformed execution id: {raw}")]
    MalformedId { raw: String },
}

pub fn parse_execution_id(raw: &str) -> Result<Uuid, ConversionError> {
    Uuid::parse_str(raw).map_err(|_| ConversionError::MalformedId {
        raw: raw.to_string(),
    })
}

/// Builds the effective policy for a request: absent fields fall back to the
/// service defaults, with the deployment-level default timeout taking the
/// place of the built-in one.
pub fn policy_from_request(
    resources: Option<&models::ResourceSpec>,
    default_timeout_seconds: u64,
) -> domain::ResourcePolicy {
    let base = domain::ResourcePolicy {
        timeout_seconds: default_timeout_seconds,
        ..Default::default()
    };
    match resources {
        Some(spec) => domain::ResourcePolicy {
            timeout_seconds: spec.timeout_seconds.unwrap_or(base.timeout_seconds),
            memory_limit_mb: spec.memory_limit_mb.unwrap_or(base.memory_limit_mb),
            max_output_bytes: spec.max_output_bytes.unwrap_or(base.max_output_bytes),
        },
        None => base,
    }
}

impl From<models::Language> for domain::Language {
    fn from(language: models::Language) -> Self {
        match language {
            models::Language::Python => domain::Language::Python,
        }
    }
}

impl From<domain::ExecutionState> for models::ExecutionState {
    fn from(state: domain::ExecutionState) -> Self {
        match state {
            domain::ExecutionState::Queued => models::ExecutionState::Queued,
            domain::ExecutionState::Running => models::ExecutionState::Running,
            domain::ExecutionState::Succeeded => models::ExecutionState::Succeeded,
            domain::ExecutionState::Failed => models::ExecutionState::Failed,
            domain::ExecutionState::TimedOut => models::ExecutionState::TimedOut,
            domain::ExecutionState::MemoryExceeded => models::ExecutionState::MemoryExceeded,
            domain::ExecutionState::Killed => models::ExecutionState::Killed,
        }
    }
}

impl From<domain::Execution> for models::ExecutionReport {
    fn from(execution: domain::Execution) -> Self {
        let state = models::ExecutionState::from(execution.state);
        Self {
            success: execution.state == domain::ExecutionState::Succeeded,
            stdout: execution.stdout,
            stderr: execution.stderr,
            exit_code: execution.exit_code.unwrap_or(-1),
            exec_time_sec: execution.exec_time_sec.unwrap_or(0.0),
            memory_used_mb: execution.memory_used_mb.unwrap_or(0.0),
            state: state as i32,
        }
    }
}

impl From<domain::Execution> for models::StatusResponse {
    fn from(execution: domain::Execution) -> Self {
        let state = models::ExecutionState::from(execution.state);
        Self {
            state: state as i32,
            is_completed: execution.is_terminal(),
            exit_code: execution.exit_code,
            exec_time_sec: execution.exec_time_sec,
            memory_used_mb: execution.memory_used_mb,
            created_at: Some(models::chrono_to_prost(execution.created_at)),
            started_at: execution.started_at.map(models::chrono_to_prost),
            completed_at: execution.completed_at.map(models::chrono_to_prost),
        }
    }
}

impl From<OutputChunk> for models::LogChunk {
    fn from(chunk: OutputChunk) -> Self {
        match chunk {
            OutputChunk::Stdout(data) => Self {
                stream: models::LogStreamKind::Stdout as i32,
                data,
            },
            OutputChunk::Stderr(data) => Self {
                stream: models::LogStreamKind::Stderr as i32,
                data,
            },
        }
    }
}
