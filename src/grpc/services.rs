use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::mpsc::channel;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::coordinator::{CoordinatorError, ExecutionCoordinator, LogEvent};
use crate::grpc::mappers::{parse_execution_id, policy_from_request};
use crate::grpc::models::{
    CancelRequest, CancelResponse, ExecuteAsyncResponse, ExecuteRequest, ExecutionReport,
    LogChunk, LogsRequest, LogsResponse, StatusRequest, StatusResponse,
    sandbox_service_server::SandboxService,
};

#[derive(Clone, Debug)]
pub struct SandboxServiceImpl {
    coordinator: Arc<ExecutionCoordinator>,
    default_timeout_seconds: u64,
}

impl SandboxServiceImpl {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, default_timeout_seconds: u64) -> Self {
        Self {
            coordinator,
            default_timeout_seconds,
        }
    }
}

fn into_status(error: CoordinatorError) -> Status {
    match error {
        CoordinatorError::InvalidPolicy(e) => Status::invalid_argument(e.to_string()),
        CoordinatorError::NotFound(id) => {
            Status::not_found(format!("unknown execution id: {id}"))
        }
    }
}

#[tonic::async_trait]
impl SandboxService for SandboxServiceImpl {
    #[tracing::instrument(skip(self, request))]
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecutionReport>, Status> {
        let req = request.into_inner();
        let language = req.language().into();
        let policy = policy_from_request(req.resources.as_ref(), self.default_timeout_seconds);

        let execution = self
            .coordinator
            .submit_sync(req.code, language, policy)
            .await
            .map_err(into_status)?;

        Ok(Response::new(execution.into()))
    }

    #[tracing::instrument(skip(self, request))]
    async fn execute_async(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteAsyncResponse>, Status> {
        let req = request.into_inner();
        let language = req.language().into();
        let policy = policy_from_request(req.resources.as_ref(), self.default_timeout_seconds);

        let id = self
            .coordinator
            .submit_async(req.code, language, policy)
            .map_err(into_status)?;

        Ok(Response::new(ExecuteAsyncResponse {
            execution_id: id.to_string(),
        }))
    }

    #[tracing::instrument(skip(self, request))]
    async fn get_status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let execution = self.coordinator.get_status(id).await.map_err(into_status)?;
        Ok(Response::new(execution.into()))
    }

    #[tracing::instrument(skip(self, request))]
    async fn get_logs(
        &self,
        request: Request<LogsRequest>,
    ) -> Result<Response<LogsResponse>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let (stdout, stderr) = self.coordinator.get_logs(id).await.map_err(into_status)?;
        Ok(Response::new(LogsResponse { stdout, stderr }))
    }

    type StreamLogsStream = ReceiverStream<Result<LogChunk, Status>>;

    #[tracing::instrument(skip(self, request))]
    async fn stream_logs(
        &self,
        request: Request<LogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        // Subscribe before reading the state: anything that went terminal
        // earlier has already published its Terminated event, so the stream
        // below cannot miss the end of the run.
        let mut events = self.coordinator.follow_logs(id).map_err(into_status)?;
        let execution = self.coordinator.get_status(id).await.map_err(into_status)?;

        let (stream_tx, stream_rx) = channel::<Result<LogChunk, Status>>(128);
        if !execution.is_terminal() {
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(LogEvent::Chunk(chunk)) => {
                            if stream_tx.send(Ok(chunk.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(LogEvent::Terminated(_)) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(%id, skipped, "log follower lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    #[tracing::instrument(skip(self, request))]
    async fn cancel(
        &self,
        request: Request<CancelRequest>,
    ) -> Result<Response<CancelResponse>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let cancelled = self.coordinator.cancel(id).await.map_err(into_status)?;
        Ok(Response::new(CancelResponse { cancelled }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_stream::StreamExt;
    use uuid::Uuid;

    use crate::constants::DEFAULT_TIMEOUT_SECONDS;
    use crate::coordinator::CoordinatorConfig;
    use crate::domain::{Language, ResourcePolicy};
    use crate::grpc::models::{self, ResourceSpec};
    use crate::runner::stubs::RunnerStub;
    use crate::runner::traits::{OutputChunk, RunResult, Runner, RunnerError};

    fn ok_result(stdout: &str) -> RunResult {
        RunResult {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            exec_time_sec: 0.1,
            memory_used_mb: 16.0,
        }
    }

    fn service_with(runner: Arc<dyn Runner>) -> SandboxServiceImpl {
        let coordinator = ExecutionCoordinator::new(
            runner,
            CoordinatorConfig {
                max_workers: 2,
                ..Default::default()
            },
        );
        SandboxServiceImpl::new(coordinator, DEFAULT_TIMEOUT_SECONDS)
    }

    fn execute_request(code: &str, resources: Option<ResourceSpec>) -> ExecuteRequest {
        ExecuteRequest {
            language: models::Language::Python as i32,
            code: code.to_string(),
            resources,
        }
    }

    #[tokio::test]
    async fn execute_returns_the_final_report() {
        let runner = Arc::new(RunnerStub::new(
            Ok(ok_result("Hello, World!\n")),
            Duration::from_millis(10),
        ));
        let service = service_with(runner);

        let response = service
            .execute(Request::new(execute_request("print('Hello, World!')", None)))
            .await
            .unwrap();
        let report = response.into_inner();

        assert!(report.success);
        assert_eq!(report.stdout, "Hello, World!\n");
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.state, models::ExecutionState::Succeeded as i32);
    }

    #[tokio::test]
    async fn execute_rejects_a_zero_timeout() {
        let runner = Arc::new(RunnerStub::new(Ok(ok_result("")), Duration::ZERO));
        let service = service_with(runner);

        let request = execute_request(
            "print(1)",
            Some(ResourceSpec {
                timeout_seconds: Some(0),
                memory_limit_mb: None,
                max_output_bytes: None,
            }),
        );

        let error = service.execute(Request::new(request)).await.unwrap_err();
        assert_eq!(error.code(), tonic::Code::InvalidArgument);
        assert!(error.message().contains("timeout_seconds"));
    }

    #[tokio::test]
    async fn execute_async_then_poll_until_completed() {
        let runner = Arc::new(RunnerStub::new(
            Ok(ok_result("done\n")),
            Duration::from_millis(30),
        ));
        let service = service_with(runner);

        let response = service
            .execute_async(Request::new(execute_request("print('done')", None)))
            .await
            .unwrap();
        let execution_id = response.into_inner().execution_id;

        let mut completed = None;
        for _ in 0..100 {
            let status = service
                .get_status(Request::new(StatusRequest {
                    execution_id: execution_id.clone(),
                }))
                .await
                .unwrap()
                .into_inner();
            if status.is_completed {
                completed = Some(status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = completed.expect("execution never completed");
        assert_eq!(status.state, models::ExecutionState::Succeeded as i32);
        assert_eq!(status.exit_code, Some(0));

        let logs = service
            .get_logs(Request::new(LogsRequest { execution_id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(logs.stdout, "done\n");
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_distinguished() {
        let runner = Arc::new(RunnerStub::new(Ok(ok_result("")), Duration::ZERO));
        let service = service_with(runner);

        let error = service
            .get_status(Request::new(StatusRequest {
                execution_id: Uuid::new_v4().to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::NotFound);

        let error = service
            .get_status(Request::new(StatusRequest {
                execution_id: "garbage".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_execution() {
        let runner = Arc::new(RunnerStub::new(
            Ok(ok_result("never\n")),
            Duration::from_secs(30),
        ));
        let service = service_with(runner);

        let execution_id = service
            .execute_async(Request::new(execute_request("import time; time.sleep(60)", None)))
            .await
            .unwrap()
            .into_inner()
            .execution_id;

        // Let the worker pick it up before cancelling.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = service
            .cancel(Request::new(CancelRequest {
                execution_id: execution_id.clone(),
            }))
            .await
            .unwrap();
        assert!(response.into_inner().cancelled);

        let mut state = None;
        for _ in 0..100 {
            let status = service
                .get_status(Request::new(StatusRequest {
                    execution_id: execution_id.clone(),
                }))
                .await
                .unwrap()
                .into_inner();
            if status.is_completed {
                state = Some(status.state);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, Some(models::ExecutionState::Killed as i32));
    }

    /// Runner that stays quiet for a while before producing output, so a
    /// follower attached right after submission sees the chunks live.
    #[derive(Debug)]
    struct DelayedChunkRunner;

    #[async_trait::async_trait]
    impl Runner for DelayedChunkRunner {
        async fn run(
            &self,
            _code: &str,
            _language: Language,
            _policy: &ResourcePolicy,
            output: tokio::sync::mpsc::Sender<OutputChunk>,
        ) -> Result<RunResult, RunnerError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            output
                .send(OutputChunk::Stdout("tick\n".to_string()))
                .await
                .ok();
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ok_result_for_stream())
        }
    }

    fn ok_result_for_stream() -> RunResult {
        RunResult {
            success: true,
            stdout: "tick\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            exec_time_sec: 0.25,
            memory_used_mb: 4.0,
        }
    }

    #[tokio::test]
    async fn stream_logs_follows_a_live_execution_to_its_end() {
        let service = service_with(Arc::new(DelayedChunkRunner));

        let execution_id = service
            .execute_async(Request::new(execute_request("print('tick')", None)))
            .await
            .unwrap()
            .into_inner()
            .execution_id;

        let response = service
            .stream_logs(Request::new(LogsRequest { execution_id }))
            .await
            .unwrap();
        let mut stream = response.into_inner();

        let mut data = String::new();
        while let Some(chunk) = stream.next().await {
            data.push_str(&chunk.unwrap().data);
        }
        assert_eq!(data, "tick\n");
    }

    #[tokio::test]
    async fn stream_logs_on_a_terminal_execution_ends_immediately() {
        let runner = Arc::new(RunnerStub::new(Ok(ok_result("done\n")), Duration::ZERO));
        let service = service_with(runner);

        let execution_id = service
            .execute_async(Request::new(execute_request("print('done')", None)))
            .await
            .unwrap()
            .into_inner()
            .execution_id;

        // Wait for the terminal state first.
        for _ in 0..100 {
            let status = service
                .get_status(Request::new(StatusRequest {
                    execution_id: execution_id.clone(),
                }))
                .await
                .unwrap()
                .into_inner();
            if status.is_completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = service
            .stream_logs(Request::new(LogsRequest { execution_id }))
            .await
            .unwrap();
        let mut stream = response.into_inner();
        assert!(stream.next().await.is_none());
    }
}
