//! Request dispatcher: the agent's `MountHandler`.
//!
//! Every failure is folded into an error response with a short human
//! message; the full story lives in the agent's logs and in the ledger
//! blobs the coordinator records on its side.

use async_trait::async_trait;

use common::message::{MountAction, MountRequest, MountResponse};
use common::rpc::MountHandler;

use crate::executor::MountExecutor;

pub struct AgentDispatcher {
    executor: MountExecutor,
}

impl AgentDispatcher {
    pub fn new(executor: MountExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl MountHandler for AgentDispatcher {
    async fn handle(&self, request: MountRequest) -> MountResponse {
        if let Err(e) = request.validate() {
            tracing::warn!("rejecting invalid request: {}", e);
            return MountResponse::error(e.to_string());
        }

        let target_id = request.backup_target.id.clone();
        match request.action {
            MountAction::Mount => match self.executor.mount(&request).await {
                Ok(mount_path) => {
                    tracing::info!(
                        target_id = %target_id,
                        job_id = request.job.id,
                        mount_path = %mount_path.display(),
                        "mount complete"
                    );
                    MountResponse::success(
                        format!("target {target_id} mounted"),
                        Some(mount_path.display().to_string()),
                    )
                }
                Err(e) => {
                    tracing::error!(target_id = %target_id, "mount failed: {}", e);
                    MountResponse::error(e.to_string())
                }
            },
            MountAction::Unmount => match self.executor.unmount(&request).await {
                Ok(()) => {
                    tracing::info!(
                        target_id = %target_id,
                        job_id = request.job.id,
                        "unmount complete"
                    );
                    MountResponse::success(format!("target {target_id} unmounted"), None)
                }
                Err(e) => {
                    tracing::error!(target_id = %target_id, "unmount failed: {}", e);
                    MountResponse::error(e.to_string())
                }
            },
        }
    }
}

impl std::fmt::Debug for AgentDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDispatcher")
            .field("executor", &self.executor)
            .finish()
    }
}
