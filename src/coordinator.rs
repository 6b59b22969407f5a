use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, RwLock, Semaphore, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::constants::WATCHDOG_GRACE;
use crate::domain::{Execution, ExecutionState, Language, PolicyError, ResourcePolicy};
use crate::formatter;
use crate::runner::traits::{LimitKind, OutputChunk, RunResult, Runner, RunnerError};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Upper bound on concurrently running executions. Submissions past the
    /// bound queue for a worker slot instead of failing.
    pub max_workers: usize,
    /// Wall-clock slack past the policy timeout before the coordinator
    /// force-kills a worker that has not reached a terminal state.
    pub watchdog_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            watchdog_grace: WATCHDOG_GRACE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid resource policy: {0}")]
    InvalidPolicy(#[from] PolicyError),
    #[error("unknown execution id: {0}")]
    NotFound(Uuid),
}

/// Event published to live log followers.
#[derive(Clone, Debug)]
pub enum LogEvent {
    Chunk(OutputChunk),
    Terminated(ExecutionState),
}

#[derive(Debug)]
struct ExecutionEntry {
    record: Arc<RwLock<Execution>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    kill_rx: Mutex<Option<oneshot::Receiver<()>>>,
    log_tx: broadcast::Sender<LogEvent>,
}

/// Owns every execution record: assigns identity, drives the state machine,
/// dispatches to the runner, and serializes access to mutable state. The
/// runner is handed the code and policy for one run and nothing else.
#[derive(Debug)]
pub struct ExecutionCoordinator {
    runner: Arc<dyn Runner>,
    executions: DashMap<Uuid, Arc<ExecutionEntry>>,
    permits: Arc<Semaphore>,
    watchdog_grace: Duration,
}

impl ExecutionCoordinator {
    pub fn new(runner: Arc<dyn Runner>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            runner,
            executions: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            watchdog_grace: config.watchdog_grace,
        })
    }

    /// Creates the execution, runs it to a terminal state and returns the
    /// final record. Faults and limit violations in the executed code come
    /// back inside the record, never as an error.
    #[tracing::instrument(skip(self, code))]
    pub async fn submit_sync(
        self: &Arc<Self>,
        code: String,
        language: Language,
        policy: ResourcePolicy,
    ) -> Result<Execution, CoordinatorError> {
        let id = self.create(code, language, policy)?;
        self.spawn_worker(id).await.ok();
        self.get_status(id).await
    }

    /// Creates the execution and returns its id immediately; the run
    /// proceeds on an independent worker.
    #[tracing::instrument(skip(self, code))]
    pub fn submit_async(
        self: &Arc<Self>,
        code: String,
        language: Language,
        policy: ResourcePolicy,
    ) -> Result<Uuid, CoordinatorError> {
        let id = self.create(code, language, policy)?;
        self.spawn_worker(id);
        Ok(id)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Execution, CoordinatorError> {
        let entry = self.entry(id)?;
        let record = entry.record.read().await;
        Ok(record.clone())
    }

    /// Captured output so far; partial while the execution is running.
    pub async fn get_logs(&self, id: Uuid) -> Result<(String, String), CoordinatorError> {
        let entry = self.entry(id)?;
        let record = entry.record.read().await;
        Ok((record.stdout.clone(), record.stderr.clone()))
    }

    /// Live log feed starting at the moment of the call, ending with a
    /// `Terminated` event. `get_logs` covers everything captured earlier.
    pub fn follow_logs(&self, id: Uuid) -> Result<broadcast::Receiver<LogEvent>, CoordinatorError> {
        let entry = self.entry(id)?;
        Ok(entry.log_tx.subscribe())
    }

    /// Requests cancellation of a queued or running execution. Cancelling a
    /// terminal execution is a no-op, not an error; `Ok(true)` means a kill
    /// was actually delivered.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<bool, CoordinatorError> {
        let entry = self.entry(id)?;
        if entry.record.read().await.is_terminal() {
            return Ok(false);
        }
        let result = match entry.kill_tx.lock().await.take() {
            Some(kill_tx) => Ok(kill_tx.send(()).is_ok()),
            None => Ok(false),
        };
        result
    }

    fn create(
        &self,
        code: String,
        language: Language,
        policy: ResourcePolicy,
    ) -> Result<Uuid, CoordinatorError> {
        policy.validate()?;

        let execution = Execution::new(code, language, policy);
        let id = execution.id;
        let (kill_tx, kill_rx) = oneshot::channel();
        let (log_tx, _) = broadcast::channel(256);

        self.executions.insert(
            id,
            Arc::new(ExecutionEntry {
                record: Arc::new(RwLock::new(execution)),
                kill_tx: Mutex::new(Some(kill_tx)),
                kill_rx: Mutex::new(Some(kill_rx)),
                log_tx,
            }),
        );
        tracing::info!(%id, "execution created");
        Ok(id)
    }

    fn spawn_worker(self: &Arc<Self>, id: Uuid) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.drive(id).await })
    }

    #[tracing::instrument(skip(self))]
    async fn drive(&self, id: Uuid) {
        let Some(entry) = self.executions.get(&id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let Some(mut kill_rx) = entry.kill_rx.lock().await.take() else {
            return;
        };

        // Queued: wait for a worker slot unless cancelled first.
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                let Ok(permit) = permit else { return };
                permit
            }
            _ = &mut kill_rx => {
                self.finish(&entry, ExecutionState::Killed, None).await;
                return;
            }
        };

        let (code, language, policy) = {
            let mut record = entry.record.write().await;
            if record.is_terminal() {
                return;
            }
            record.state = ExecutionState::Running;
            record.started_at = Some(Utc::now());
            (record.code.clone(), record.language, record.policy)
        };

        let (chunk_tx, chunk_rx) = mpsc::channel::<OutputChunk>(128);
        let forwarder = spawn_forwarder(Arc::clone(&entry), chunk_rx, policy);

        // Secondary enforcement: the runner is expected to bound the run on
        // its own; the watchdog covers the gap where it cannot. Dropping the
        // run future kills the worker process (kill_on_drop).
        let deadline = Duration::from_secs(policy.timeout_seconds) + self.watchdog_grace;
        let outcome = tokio::select! {
            result = self.runner.run(&code, language, &policy, chunk_tx) => Some(result),
            _ = &mut kill_rx => None,
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(%id, "watchdog expired, force-killing worker");
                None
            }
        };
        forwarder.await.ok();

        match outcome {
            Some(Ok(result)) => {
                let state = if result.success {
                    ExecutionState::Succeeded
                } else {
                    ExecutionState::Failed
                };
                let result = formatter::finalize(result, &policy);
                self.finish(&entry, state, Some(result)).await;
            }
            Some(Err(RunnerError::LimitsExceeded { result, limit })) => {
                let state = match limit {
                    LimitKind::CpuTime => ExecutionState::TimedOut,
                    LimitKind::Memory => ExecutionState::MemoryExceeded,
                };
                let result = formatter::finalize(result, &policy);
                self.finish(&entry, state, Some(result)).await;
            }
            Some(Err(RunnerError::FailedToLaunch { msg })) => {
                tracing::error!(%id, %msg, "runner failed to launch");
                let result = RunResult {
                    success: false,
                    stdout: String::new(),
                    stderr: msg,
                    exit_code: -1,
                    exec_time_sec: 0.0,
                    memory_used_mb: 0.0,
                };
                self.finish(&entry, ExecutionState::Failed, Some(result)).await;
            }
            None => self.finish(&entry, ExecutionState::Killed, None).await,
        }
    }

    /// Writes the terminal state exactly once. A record that is already
    /// terminal is left untouched, which is what makes terminal states
    /// absorbing.
    async fn finish(&self, entry: &ExecutionEntry, state: ExecutionState, result: Option<RunResult>) {
        let mut record = entry.record.write().await;
        if record.is_terminal() {
            return;
        }
        record.state = state;
        record.completed_at = Some(Utc::now());
        match result {
            Some(result) => {
                record.stdout = result.stdout;
                record.stderr = result.stderr;
                record.exit_code = Some(result.exit_code);
                record.exec_time_sec = Some(result.exec_time_sec);
                record.memory_used_mb = Some(result.memory_used_mb);
            }
            None => {
                // Killed: keep the partial output already captured. A run
                // that never started has no exit code or wall time.
                if let Some(started_at) = record.started_at {
                    record.exit_code = Some(128 + libc::SIGKILL);
                    if let Some(completed_at) = record.completed_at {
                        record.exec_time_sec =
                            Some((completed_at - started_at).num_milliseconds() as f64 / 1000.0);
                    }
                }
            }
        }
        let _ = entry.log_tx.send(LogEvent::Terminated(state));
        tracing::info!(id = %record.id, ?state, "execution finished");
    }

    fn entry(&self, id: Uuid) -> Result<Arc<ExecutionEntry>, CoordinatorError> {
        self.executions
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(CoordinatorError::NotFound(id))
    }
}

/// Single writer for a running execution's output fields: appends incoming
/// chunks to the record and republishes them to live followers. Ends when
/// the runner drops its sender.
fn spawn_forwarder(
    entry: Arc<ExecutionEntry>,
    mut chunk_rx: Receiver<OutputChunk>,
    policy: ResourcePolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Slightly above the policy ceiling so the formatter can still
        // detect overflow in the terminal record.
        let cap = policy.max_output_bytes as usize + 64;
        while let Some(chunk) = chunk_rx.recv().await {
            {
                let mut record = entry.record.write().await;
                if record.is_terminal() {
                    break;
                }
                match &chunk {
                    OutputChunk::Stdout(data) => append_capped(&mut record.stdout, data, cap),
                    OutputChunk::Stderr(data) => append_capped(&mut record.stderr, data, cap),
                }
            }
            let _ = entry.log_tx.send(LogEvent::Chunk(chunk));
        }
    })
}

fn append_capped(buffer: &mut String, data: &str, cap: usize) {
    if buffer.len() >= cap {
        return;
    }
    let mut cut = (cap - buffer.len()).min(data.len());
    while cut > 0 && !data.is_char_boundary(cut) {
        cut -= 1;
    }
    buffer.push_str(&data[..cut]);
}
