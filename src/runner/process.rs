use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::constants::{EXIT_CODE_MEMORY_EXCEEDED, EXIT_CODE_TIMED_OUT};
use crate::domain::{Language, ResourcePolicy};
use crate::runner::traits::{LimitKind, OutputChunk, RunResult, Runner, RunnerError};

/// Interval between peak-memory samples taken from /proc/<pid>/status.
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// Bytes captured past the policy ceiling so the formatter can tell a
/// stream that filled it exactly from one that overflowed it.
const CAPTURE_SLACK_BYTES: usize = 64;

/// Runs one execution per OS process with kernel-enforced ceilings.
///
/// Isolation is applied at the process boundary, not inside the executed
/// code: rlimits installed between fork and exec cap CPU time, address
/// space, and process creation; the interpreter starts in isolated mode
/// with a cleared environment, a private scratch directory, and a closed
/// stdin. Filesystem and network confinement of the runtime itself belong
/// to the container provisioned by the orchestration layer.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    python_path: PathBuf,
    scratch_root: PathBuf,
}

impl ProcessRunner {
    pub fn new() -> std::io::Result<Self> {
        let scratch_root = std::env::temp_dir().join("sandboxd");
        std::fs::create_dir_all(&scratch_root)?;

        let python_path =
            std::env::var("PYTHON_PATH").unwrap_or_else(|_| "python3".to_string());

        Ok(Self {
            python_path: python_path.into(),
            scratch_root,
        })
    }

    fn command(
        &self,
        code: &str,
        language: Language,
        policy: &ResourcePolicy,
        work_dir: &Path,
    ) -> Command {
        let mut cmd = match language {
            Language::Python => {
                let mut cmd = Command::new(&self.python_path);
                // -I ignores PYTHON* env vars, the user site dir and argv[0]
                // on sys.path; in-language hardening only, the rlimits below
                // are the authoritative control.
                cmd.arg("-I").arg("-c").arg(code);
                cmd
            }
        };

        cmd.env_clear()
            .env("PYTHONUNBUFFERED", "1")
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cpu_secs = policy.timeout_seconds as libc::rlim_t;
        let mem_bytes = (policy.memory_limit_mb * 1024 * 1024) as libc::rlim_t;
        unsafe {
            cmd.pre_exec(move || {
                // Own session, so the child never signals the service's
                // process group. Failure is not fatal.
                libc::setsid();

                // Hard kernel ceilings; the executed code cannot lift them.
                // The soft CPU limit delivers SIGXCPU at the policy value,
                // the hard limit SIGKILLs one second later.
                set_rlimit(libc::RLIMIT_CPU, cpu_secs, cpu_secs + 1)?;
                set_rlimit(libc::RLIMIT_AS, mem_bytes, mem_bytes)?;
                set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
                // The interpreter process already exists, so any further
                // fork/clone by this user id fails: subprocess denial.
                set_rlimit(libc::RLIMIT_NPROC, 1, 1)?;
                Ok(())
            });
        }

        cmd
    }
}

unsafe fn set_rlimit(resource: u32, cur: libc::rlim_t, max: libc::rlim_t) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: cur,
        rlim_max: max,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Reads one pipe to EOF, forwarding chunks and keeping the first `cap`
/// bytes. Past the cap the pipe is still drained so the child never blocks
/// on a full buffer; the excess is dropped.
fn spawn_capture<R>(
    mut pipe: R,
    cap: usize,
    chunk_tx: Sender<OutputChunk>,
    wrap: fn(String) -> OutputChunk,
) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if captured.len() < cap {
                        let take = (cap - captured.len()).min(n);
                        captured.extend_from_slice(&buf[..take]);
                        let chunk = wrap(String::from_utf8_lossy(&buf[..take]).into_owned());
                        chunk_tx.send(chunk).await.ok();
                    }
                }
            }
        }
        captured
    })
}

/// Samples VmHWM (peak resident set) from procfs while the child runs.
/// Host-side accounting; nothing is trusted from inside the sandbox.
fn spawn_memory_sampler(pid: u32, peak_kb: Arc<AtomicU64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status_path = format!("/proc/{pid}/status");
        loop {
            match tokio::fs::read_to_string(&status_path).await {
                // A zombie's status file drops the memory lines; either way
                // the process is gone and the sampled peak stands.
                Ok(status) => match parse_vm_hwm_kb(&status) {
                    Some(kb) => {
                        peak_kb.fetch_max(kb, Ordering::Relaxed);
                    }
                    None => break,
                },
                Err(_) => break,
            }
            tokio::time::sleep(MEMORY_SAMPLE_INTERVAL).await;
        }
    })
}

fn parse_vm_hwm_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmHWM:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[async_trait::async_trait]
impl Runner for ProcessRunner {
    #[tracing::instrument(skip(self, code, output))]
    async fn run(
        &self,
        code: &str,
        language: Language,
        policy: &ResourcePolicy,
        output: Sender<OutputChunk>,
    ) -> Result<RunResult, RunnerError> {
        let work_dir = self.scratch_root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| RunnerError::FailedToLaunch {
                msg: format!("failed to create scratch dir: {e}"),
            })?;

        let mut cmd = self.command(code, language, policy, &work_dir);
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| RunnerError::FailedToLaunch {
            msg: format!("failed to spawn interpreter: {e}"),
        })?;

        let capture_cap = policy.max_output_bytes as usize + CAPTURE_SLACK_BYTES;
        let stdout_pipe = child.stdout.take().ok_or_else(|| RunnerError::FailedToLaunch {
            msg: "child stdout pipe missing".to_string(),
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| RunnerError::FailedToLaunch {
            msg: "child stderr pipe missing".to_string(),
        })?;

        let stdout_task = spawn_capture(stdout_pipe, capture_cap, output.clone(), OutputChunk::Stdout);
        let stderr_task = spawn_capture(stderr_pipe, capture_cap, output, OutputChunk::Stderr);

        let peak_kb = Arc::new(AtomicU64::new(0));
        let sampler = child.id().map(|pid| spawn_memory_sampler(pid, peak_kb.clone()));

        // Secondary wall-clock guard inside the runner: RLIMIT_CPU cannot
        // fire for a child that sleeps instead of computing.
        let wall_limit = Duration::from_secs(policy.timeout_seconds);
        let (status, wall_expired) = match timeout(wall_limit, child.wait()).await {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(e)) => {
                if let Some(sampler) = sampler {
                    sampler.abort();
                }
                tokio::fs::remove_dir_all(&work_dir).await.ok();
                return Err(RunnerError::FailedToLaunch {
                    msg: format!("failed to wait for child: {e}"),
                });
            }
            Err(_) => {
                child.kill().await.ok();
                (child.wait().await.ok(), true)
            }
        };
        let exec_time_sec = start.elapsed().as_secs_f64();

        if let Some(sampler) = sampler {
            sampler.abort();
        }

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        tokio::fs::remove_dir_all(&work_dir).await.ok();

        let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
        let memory_used_mb = peak_kb.load(Ordering::Relaxed) as f64 / 1024.0;

        let (exit_code, signal) = match &status {
            Some(status) => {
                use std::os::unix::process::ExitStatusExt;
                (status.code(), status.signal())
            }
            None => (None, Some(libc::SIGKILL)),
        };

        let timed_out = wall_expired
            || signal == Some(libc::SIGXCPU)
            || (signal == Some(libc::SIGKILL)
                && exec_time_sec + 0.25 >= policy.timeout_seconds as f64);

        // RLIMIT_AS denies the allocation rather than killing the process;
        // the interpreter then dies with a MemoryError trace. Either way the
        // limit was enforced by the kernel, so both shapes classify the same.
        let memory_exceeded = !timed_out
            && (memory_used_mb >= policy.memory_limit_mb as f64
                || (exit_code != Some(0) && stderr.contains("MemoryError")));

        let result = RunResult {
            success: false,
            stdout,
            stderr,
            exit_code: 0,
            exec_time_sec,
            memory_used_mb,
        };

        if timed_out {
            return Err(RunnerError::LimitsExceeded {
                result: RunResult {
                    exit_code: EXIT_CODE_TIMED_OUT,
                    ..result
                },
                limit: LimitKind::CpuTime,
            });
        }
        if memory_exceeded {
            return Err(RunnerError::LimitsExceeded {
                result: RunResult {
                    exit_code: EXIT_CODE_MEMORY_EXCEEDED,
                    ..result
                },
                limit: LimitKind::Memory,
            });
        }

        let exit_code = match (exit_code, signal) {
            (Some(code), _) => code,
            (None, Some(signo)) => 128 + signo,
            (None, None) => -1,
        };

        Ok(RunResult {
            success: exit_code == 0,
            exit_code,
            ..result
        })
    }
}
