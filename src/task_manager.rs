//! Task manager: moves step-done tasks into the next stage's queue, and
//! emulates the remote service when server interaction is disabled.
use crate::error::HandleLoopError;
use crate::models::{AppConfig, Stage};
use crate::pack::archive_name;
use crate::task_store::TaskStore;
use camino::Utf8PathBuf;
use ndarray::{s, Array3};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Ingress queues of the task-id driven stages. Compile has no queue here:
/// its sweep re-reads (compile, processing) tasks from the store.
pub(crate) struct StageSenders {
    pub validate: UnboundedSender<String>,
    pub pack: UnboundedSender<String>,
    pub upload: UnboundedSender<String>,
    pub download: UnboundedSender<String>,
    pub unpack: UnboundedSender<String>,
    pub send: UnboundedSender<String>,
}

impl StageSenders {
    fn sender_for(&self, stage: Stage) -> Option<&UnboundedSender<String>> {
        match stage {
            Stage::Compile => None,
            Stage::Validate => Some(&self.validate),
            Stage::Pack => Some(&self.pack),
            Stage::Upload => Some(&self.upload),
            Stage::Download => Some(&self.download),
            Stage::Unpack => Some(&self.unpack),
            Stage::Send => Some(&self.send),
        }
    }
}

pub(crate) async fn task_manager_loop(
    store: TaskStore,
    senders: StageSenders,
    server_interaction: bool,
    cancel: CancellationToken,
) -> Result<(), HandleLoopError> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        match store.claim_step_done().await {
            Ok(tasks) => {
                for task in tasks {
                    tracing::info!(task_id = task.id, stage = %task.current_step, "dispatching task");
                    match senders.sender_for(task.current_step) {
                        Some(sender) => {
                            if sender.send(task.id.clone()).is_err() {
                                tracing::error!(
                                    task_id = task.id,
                                    "stage {} is gone; task left in processing",
                                    task.current_step
                                );
                            }
                        }
                        // a task restarted to compile is picked up by the sweep
                        None => {}
                    }
                }
            }
            Err(e) => tracing::error!("task manager cannot reach the store: {e}"),
        }

        if !server_interaction {
            if let Err(e) = simulate_pending(&store).await {
                tracing::error!("simulated processing failed: {e:#}");
            }
        }
    }
    Ok(())
}

/// Stand-in for the remote service: replace `voxels.npy` of every uploaded
/// archive with a `denoised.npy`/`noise.npy` pair and park the result under
/// `processed/`.
async fn simulate_pending(store: &TaskStore) -> anyhow::Result<()> {
    let pending = store.tasks_with_status("processing").await?;
    if pending.is_empty() {
        return Ok(());
    }
    let config = store.app_config().await?;
    for task in pending {
        let task_id = task.id.clone();
        let config_for_task = config.clone();
        let result = {
            let task_id = task_id.clone();
            tokio::task::spawn_blocking(move || simulate_processing(&task_id, &config_for_task))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r)
        };
        match result {
            Ok(()) => {
                tracing::info!(task_id, "simulated remote processing done");
                store.set_status(&task_id, "processed").await?;
                store.set_ready_for_download(&task_id).await?;
            }
            Err(e) => tracing::error!(task_id, "simulated processing failed: {e:#}"),
        }
    }
    Ok(())
}

fn simulate_processing(task_id: &str, config: &AppConfig) -> anyhow::Result<()> {
    let filename = archive_name(task_id, &config.client_id);
    let shared = Utf8PathBuf::from(&config.shared_mount_point);
    let uploaded = shared.join("to_process").join(&filename);
    let scratch = Utf8PathBuf::from("temp")
        .join("simulated_processing")
        .join(task_id);
    crate::archive::extract_zip(&uploaded, &scratch)?;

    let voxels_path = scratch.join("voxels.npy");
    let mut volume: Array3<f32> = ndarray_npy::read_npy(voxels_path.as_std_path())?;
    let mut noise = Array3::<f32>::zeros(volume.dim());
    let (nx, ny, nz) = volume.dim();
    // carve a central block out as "noise"
    let (x0, x1) = (nx / 4, (nx / 4 + nx / 8).max(nx / 4 + 1).min(nx));
    let (y0, y1) = (ny / 4, (ny / 4 + ny / 8).max(ny / 4 + 1).min(ny));
    let (z0, z1) = (nz / 4, (nz / 4 + nz / 8).max(nz / 4 + 1).min(nz));
    let block = volume.slice(s![x0..x1, y0..y1, z0..z1]).to_owned();
    noise.slice_mut(s![x0..x1, y0..y1, z0..z1]).assign(&block);
    volume.slice_mut(s![x0..x1, y0..y1, z0..z1]).fill(0.0);

    ndarray_npy::write_npy(scratch.join("denoised.npy").as_std_path(), &volume)?;
    ndarray_npy::write_npy(scratch.join("noise.npy").as_std_path(), &noise)?;
    fs_err::remove_file(voxels_path.as_std_path())?;

    let processed_dir = shared.join("processed");
    fs_err::create_dir_all(processed_dir.as_std_path())?;
    crate::archive::zip_directory(&scratch, &processed_dir.join(&filename))?;

    fs_err::remove_dir_all(scratch.as_std_path())?;
    fs_err::remove_file(uploaded.as_std_path())?;
    Ok(())
}
