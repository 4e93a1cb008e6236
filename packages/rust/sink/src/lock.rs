//! Scoped acquisition of the per-project update lock.
//!
//! No two orchestrator runs may update the same project concurrently. The
//! guard must be consumed by exactly one of [`ProjectLock::release`] (clean
//! completion → `idle`) or [`ProjectLock::fail`] (error → `connectorerror`);
//! dropping it unconsumed leaves the project locked and logs an error,
//! since release needs the network and `Drop` cannot await.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use cadbridge_shared::{CadBridgeError, Result};

use crate::{ProjectStatus, SinkClient};

/// Guard witnessing that this process holds the project's update lock.
#[must_use = "the lock must be released or failed on every exit path"]
#[derive(Debug)]
pub struct ProjectLock {
    armed: bool,
}

impl ProjectLock {
    /// Acquire the update lock with bounded busy-wait retry on contention.
    pub async fn acquire(
        sink: &SinkClient,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if sink.set_project_status(ProjectStatus::LockUpdating).await? {
                info!("acquired project update lock");
                return Ok(Self { armed: true });
            }
            if Instant::now() >= deadline {
                return Err(CadBridgeError::LockContention(format!(
                    "project still busy after {}s",
                    timeout.as_secs()
                )));
            }
            warn!("project busy, retrying lock acquisition");
            tokio::time::sleep(retry_interval).await;
        }
    }

    /// Release the lock after a clean run.
    pub async fn release(mut self, sink: &SinkClient) -> Result<()> {
        self.armed = false;
        if !sink.set_project_status(ProjectStatus::Idle).await? {
            return Err(CadBridgeError::Sink(
                "failed to release the project update lock".into(),
            ));
        }
        info!("released project update lock");
        Ok(())
    }

    /// Mark the project errored; the lock is consumed either way.
    pub async fn fail(mut self, sink: &SinkClient) -> Result<()> {
        self.armed = false;
        if !sink
            .set_project_status(ProjectStatus::ConnectorError)
            .await?
        {
            return Err(CadBridgeError::Sink(
                "failed to mark the project as errored".into(),
            ));
        }
        warn!("project marked connectorerror");
        Ok(())
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if self.armed {
            error!("project lock dropped without release; project left in lockupdating");
        }
    }
}
