//! Pack stage: extract the voxel volume of a task's series and write the
//! outbound archive (`voxels.npy` + `metadata.json`, zipped).
use crate::archive;
use crate::error::TaskStoreError;
use crate::models::{Stage, Task};
use crate::stage::StageContext;
use crate::voxels;
use anyhow::Context;
use camino::Utf8PathBuf;
use time::macros::format_description;

pub(crate) async fn handle_task(ctx: &StageContext, task_id: &str) -> Result<(), TaskStoreError> {
    let task = ctx.store.task(task_id).await?;
    ctx.store.set_status(task_id, "compressing").await?;
    match pack_task(ctx, &task).await {
        Ok(archive_path) => {
            tracing::info!(task_id, archive = archive_path.as_str(), "task packed");
            ctx.store.advance(task_id, Stage::Upload, "packed").await?;
        }
        Err(e) => {
            tracing::error!(task_id, "packing failed: {e:#}");
            ctx.store
                .mark_failed(
                    task_id,
                    "failed - compression",
                    &format!(
                        "An error occurred while compressing the image data to send to the \
                         remote processing server. Full error message follows:\n\n{e:#}"
                    ),
                )
                .await?;
        }
    }
    Ok(())
}

async fn pack_task(ctx: &StageContext, task: &Task) -> anyhow::Result<Utf8PathBuf> {
    let config = ctx.store.app_config().await?;
    let paths: Vec<Utf8PathBuf> = ctx
        .store
        .task_instances(&task.id)
        .await?
        .into_iter()
        .map(|i| Utf8PathBuf::from(i.filename))
        .collect();
    let series_uid = task.series.clone().context("task has no source series")?;
    let series = ctx
        .store
        .series_by_uid(&series_uid)
        .await?
        .context("source series row is gone")?;
    let study = match &series.study_uid {
        Some(uid) => ctx.store.study_by_uid(uid).await?,
        None => None,
    };

    let recon_settings: serde_json::Value = task
        .recon_settings
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("recon settings are not valid JSON")?
        .unwrap_or(serde_json::Value::Null);

    let date_format = format_description!("[year]-[month]-[day]");
    let time_format = format_description!("[hour]:[minute]:[second]");
    let series_date = series.series_date.map(|d| d.format(&date_format)).transpose()?;
    let series_time = series.series_date.map(|d| d.format(&time_format)).transpose()?;

    let zip_dir = Utf8PathBuf::from(&config.zip_dir);
    let archive_path = zip_dir.join(format!("{}_{}.zip", task.id, config.client_id));
    let staging = zip_dir.join(format!("{}_staging", task.id));

    let metadata_head = serde_json::json!({
        "client_id": config.client_id,
        "task_id": task.id,
        "recon_settings": recon_settings,
        "PatientWeight": study.as_ref().and_then(|s| s.patient_weight),
        "PatientSize": study.as_ref().and_then(|s| s.patient_size),
        "PatientAge": study.as_ref().and_then(|s| s.patient_age.clone()),
        "StudyInstanceUID": series.study_uid,
        "SeriesInstanceUID": series.series_uid,
        "SeriesNumber": series.series_number,
        "SeriesDate": series_date,
        "SeriesTime": series_time,
    });

    let archive_path_out = archive_path.clone();
    tokio::task::spawn_blocking(move || {
        let volume = voxels::extract_volume(&paths)?;
        fs_err::create_dir_all(staging.as_std_path())?;
        let voxels_path = staging.join("voxels.npy");
        ndarray_npy::write_npy(voxels_path.as_std_path(), &volume)
            .context("could not write the voxel file")?;

        let mut metadata = metadata_head;
        metadata["sha256"] = serde_json::Value::from(archive::sha256_file(&voxels_path)?);
        let metadata_file = fs_err::File::create(staging.join("metadata.json").as_std_path())?;
        serde_json::to_writer_pretty(metadata_file, &metadata)?;

        archive::zip_directory(&staging, &archive_path_out)?;
        if let Err(e) = fs_err::remove_dir_all(staging.as_std_path()) {
            tracing::warn!("could not remove the packing scratch directory: {e}");
        }
        Ok::<_, anyhow::Error>(())
    })
    .await??;
    Ok(archive_path)
}

/// `{taskId}_{clientId}.zip`, the archive name a task owns in every staging
/// area.
pub(crate) fn archive_name(task_id: &str, client_id: &str) -> String {
    format!("{task_id}_{client_id}.zip")
}
