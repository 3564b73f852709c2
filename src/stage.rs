//! Shared plumbing for the task-id driven pipeline stages.
use crate::dicom_settings::OurAETitle;
use crate::error::{HandleLoopError, TaskStoreError};
use crate::remote::RemoteClient;
use crate::task_store::TaskStore;
use camino::Utf8PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

pub(crate) const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Everything a stage handler needs besides its task id.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub store: TaskStore,
    pub remote: RemoteClient,
    /// When off, remote calls are skipped and processing is emulated locally.
    pub server_interaction: bool,
    pub incoming_root: Utf8PathBuf,
    /// Port the remote server calls back on (`/process_ready`).
    pub http_port: u16,
    pub our_aet: OurAETitle,
}

/// Drain task ids from `rx` into `handler`, one at a time.
///
/// A handler owns all domain failures: it marks the task failed itself and
/// returns `Ok`. A [TaskStoreError] means the store could not be updated;
/// the stage then retries the same task forever with a back-off, so a task
/// in `step_state=0` is never silently lost. Stop is cooperative: the
/// current task finishes, then the loop exits.
pub(crate) async fn task_stage_loop(
    name: &'static str,
    mut rx: UnboundedReceiver<String>,
    cancel: CancellationToken,
    handler: impl AsyncFn(&str) -> Result<(), TaskStoreError>,
) -> Result<(), HandleLoopError> {
    loop {
        let task_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task_id = rx.recv() => match task_id {
                Some(task_id) => task_id,
                None => break,
            },
        };
        loop {
            match handler(&task_id).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(task_id, "{name} could not update the task store: {e}");
                    if cancel.is_cancelled() {
                        return Err(HandleLoopError("stage interrupted with a task mid-step"));
                    }
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
    Ok(())
}
