//! Download stage: fetch the processed archive from the shared drop-box.
use crate::error::TaskStoreError;
use crate::models::Stage;
use crate::pack::archive_name;
use crate::stage::StageContext;
use camino::Utf8PathBuf;

pub(crate) async fn handle_task(ctx: &StageContext, task_id: &str) -> Result<(), TaskStoreError> {
    let task = ctx.store.task(task_id).await?;
    let config = ctx.store.app_config().await?;
    ctx.store.set_status(task_id, "downloading").await?;

    let filename = archive_name(&task.id, &config.client_id);
    let remote = Utf8PathBuf::from(&config.shared_mount_point)
        .join("processed")
        .join(&filename);
    let local_dir = Utf8PathBuf::from(&config.download_path);
    let local = local_dir.join(&filename);

    let result = {
        let remote = remote.clone();
        tokio::task::spawn_blocking(move || {
            fs_err::create_dir_all(local_dir.as_std_path())?;
            fs_err::copy(remote.as_std_path(), local.as_std_path())?;
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|r| r)
    };
    match result {
        Ok(()) => {
            tracing::info!(task_id, archive = filename, "processed archive downloaded");
            if let Err(e) = fs_err::tokio::remove_file(remote.as_std_path()).await {
                tracing::warn!(task_id, "could not remove the remote archive: {e}");
            }
            ctx.store.advance(task_id, Stage::Unpack, "downloaded").await?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!(task_id, "processed archive not found: {e}");
            ctx.store
                .mark_failed(
                    task_id,
                    "failed - download",
                    "The processed archive could not be downloaded: the application did not \
                     receive the expected files from the remote server. Check the shared drive \
                     and retry this step.",
                )
                .await?;
        }
        Err(e) => {
            tracing::error!(task_id, "download failed: {e}");
            ctx.store
                .mark_failed(
                    task_id,
                    "failed - download",
                    &format!(
                        "Unknown error while downloading the processed archive from the remote \
                         server. Full error message:\n\n{e}"
                    ),
                )
                .await?;
        }
    }
    Ok(())
}
