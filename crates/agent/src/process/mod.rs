pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::rpc::{RpcError, RpcServer};

use crate::dispatch::AgentDispatcher;
use crate::executor::MountExecutor;
use crate::registry::{ProcessRegistry, RegistryError};
use crate::secrets::SecretClient;
use crate::service_config::Config as ServiceConfig;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const BROKER_CONNECT_ATTEMPTS: u32 = 5;
const BROKER_BACKOFF_BASE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("process registry recovery failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("broker unreachable after {attempts} attempts: {source}")]
    Broker {
        attempts: u32,
        #[source]
        source: RpcError,
    },

    #[error("rpc serve loop failed: {0}")]
    Serve(#[source] RpcError),
}

/// Initialize logging and panic handler.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(config: &ServiceConfig) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!("Warning: Failed to create log directory {:?}: {}", log_dir, e);
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "dms-agent.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_startup(&config.node_id);

    guards
}

/// Bind the node RPC queue, retrying transient broker failures with
/// exponential backoff before giving up for good.
async fn bind_with_retry(config: &ServiceConfig) -> Result<RpcServer, ServiceError> {
    let mut last_error = None;

    for attempt in 1..=BROKER_CONNECT_ATTEMPTS {
        match RpcServer::bind(&config.broker_url, &config.node_id).await {
            Ok(server) => return Ok(server),
            Err(e) => {
                let backoff = BROKER_BACKOFF_BASE * attempt;
                tracing::warn!(
                    attempt,
                    max_attempts = BROKER_CONNECT_ATTEMPTS,
                    "broker connect failed, retrying in {:?}: {}",
                    backoff,
                    e
                );
                last_error = Some(e);
                if attempt < BROKER_CONNECT_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    Err(ServiceError::Broker {
        attempts: BROKER_CONNECT_ATTEMPTS,
        source: last_error.expect("at least one attempt was made"),
    })
}

/// Run the agent service: recover the process registry, bind the node
/// queue, and serve mount RPCs until a shutdown signal arrives.
///
/// FUSE helpers are deliberately left running on exit; they belong to the
/// mounts, not to this process.
pub async fn spawn_service(config: &ServiceConfig) -> Result<(), ServiceError> {
    let _guards = init_logging(config);

    // Mount points land under here; requests carry absolute paths, the
    // base just has to exist.
    if let Err(e) = std::fs::create_dir_all(&config.mount_base_path) {
        tracing::warn!(
            path = %config.mount_base_path.display(),
            "could not create mount base directory: {}",
            e
        );
    }

    let registry = Arc::new(ProcessRegistry::new(
        &config.pid_dir,
        &config.fuse_binary_path,
    ));
    let adopted = registry.load_existing().await?;
    let reaped = registry.cleanup_dead().await?;
    tracing::info!(adopted, reaped, "process registry recovered");

    let secrets = SecretClient::new(config.auth_url.clone());
    let executor = MountExecutor::new(
        registry.clone(),
        secrets,
        &config.privileged_mount_helper_path,
        config.privileged_mount_helper_conf.clone(),
    );
    let dispatcher = Arc::new(AgentDispatcher::new(executor));

    let server = bind_with_retry(config).await?;

    let (graceful_waiter, _shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker();

    let mut serve_handle = tokio::spawn(async move {
        server.serve(dispatcher, shutdown_rx).await
    });

    tokio::select! {
        _ = graceful_waiter => {
            // Shutdown signal observed; the serve loop drains its
            // in-flight request and returns.
            match timeout(FINAL_SHUTDOWN_TIMEOUT, &mut serve_handle).await {
                Ok(Ok(result)) => result.map_err(ServiceError::Serve)?,
                Ok(Err(join_error)) => {
                    tracing::error!("serve task panicked: {}", join_error);
                }
                Err(_) => {
                    tracing::error!(
                        "Failed to shut down within {} seconds",
                        FINAL_SHUTDOWN_TIMEOUT.as_secs()
                    );
                    serve_handle.abort();
                }
            }
        }
        result = &mut serve_handle => {
            // The serve loop ended on its own: broker failure.
            match result {
                Ok(serve_result) => serve_result.map_err(ServiceError::Serve)?,
                Err(join_error) => {
                    tracing::error!("serve task panicked: {}", join_error);
                }
            }
        }
    }

    tracing::info!("agent stopped");
    Ok(())
}
