use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
/// Applied independently to stdout and stderr.
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 262_144;

/// Reported when the CPU-time/wall-clock ceiling killed the run.
/// Same value coreutils timeout(1) reserves for this case.
pub const EXIT_CODE_TIMED_OUT: i32 = 124;
/// Reported when the memory ceiling killed the run. Same 128+SIGKILL value
/// container runtimes surface for OOM-killed workloads.
pub const EXIT_CODE_MEMORY_EXCEEDED: i32 = 137;

/// Appended to a stream that was cut at the output-size ceiling.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Extra wall-clock time the coordinator watchdog grants past the policy
/// timeout before force-killing a worker that has not reached a terminal
/// state on its own.
pub const WATCHDOG_GRACE: Duration = Duration::from_secs(5);
