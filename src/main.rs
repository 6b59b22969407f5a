use std::panic;
use std::sync::Arc;

use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use crate::constants::DEFAULT_TIMEOUT_SECONDS;
use crate::coordinator::{CoordinatorConfig, ExecutionCoordinator};
use crate::grpc::models::sandbox_service_server::SandboxServiceServer;
use crate::grpc::services::SandboxServiceImpl;
use crate::runner::process::ProcessRunner;

mod constants;
mod coordinator;
mod domain;
mod formatter;
mod grpc;
mod runner;


#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let addr = std::env::var("SANDBOXD_ADDR")
        .unwrap_or_else(|_| "[::1]:50051".to_string())
        .parse()?;
    let max_workers = std::env::var("SANDBOXD_MAX_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let default_timeout_seconds = std::env::var("SANDBOXD_DEFAULT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);

    let runner = Arc::new(ProcessRunner::new()?);
    let coordinator = ExecutionCoordinator::new(
        runner,
        CoordinatorConfig {
            max_workers,
            ..Default::default()
        },
    );
    let sandbox_service = SandboxServiceImpl::new(coordinator, default_timeout_seconds);
    let service = SandboxServiceServer::new(sandbox_service);

    tracing::info!("gRPC server listening on {}", addr);
    Server::builder().add_service(service).serve(addr).await?;

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
