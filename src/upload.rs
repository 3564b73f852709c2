//! Upload stage: move the packed archive into the shared drop-box and
//! announce it to the remote server.
use crate::error::TaskStoreError;
use crate::metadata_bag::MetadataBag;
use crate::models::{Series, Study};
use crate::pack::archive_name;
use crate::patient_age::parse_age_years;
use crate::remote::{ProcessingMetadata, ProcessingRequest};
use crate::stage::StageContext;
use crate::vendor;
use anyhow::Context;
use camino::Utf8PathBuf;
use dicom::dictionary_std::tags;
use time::macros::format_description;

pub(crate) async fn handle_task(ctx: &StageContext, task_id: &str) -> Result<(), TaskStoreError> {
    let task = ctx.store.task(task_id).await?;
    let config = ctx.store.app_config().await?;
    ctx.store.set_status(task_id, "uploading").await?;

    let filename = archive_name(&task.id, &config.client_id);
    let local = Utf8PathBuf::from(&config.zip_dir).join(&filename);
    let shared = Utf8PathBuf::from(&config.shared_mount_point);
    let drop_box = shared.join("to_process");

    let copy_result = {
        let local = local.clone();
        let target = drop_box.join(&filename);
        tokio::task::spawn_blocking(move || {
            anyhow::ensure!(
                shared.as_std_path().is_dir(),
                "{shared} is not a directory or is not mounted"
            );
            fs_err::create_dir_all(drop_box.as_std_path())?;
            fs_err::copy(local.as_std_path(), target.as_std_path())?;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|r| r)
    };
    if let Err(e) = copy_result {
        tracing::error!(task_id, "upload failed: {e:#}");
        ctx.store
            .mark_failed(
                task_id,
                "failed - upload",
                &format!(
                    "An unexpected error occurred while sending the task data to the remote \
                     server. Full error message:\n\n{e:#}"
                ),
            )
            .await?;
        return Ok(());
    }
    tracing::info!(task_id, archive = filename, "archive copied to the drop-box");

    if ctx.server_interaction {
        let notify = async {
            let request = build_processing_request(ctx, &task.id, &filename).await?;
            ctx.remote
                .notify_processing(&config.server_url, &request)
                .await
                .map_err(anyhow::Error::from)
        };
        if let Err(e) = notify.await {
            tracing::error!(task_id, "processing notification failed: {e:#}");
            ctx.store
                .mark_failed(
                    task_id,
                    "failed - upload",
                    "An error occurred while notifying the remote server of a newly \
                     uploaded task.",
                )
                .await?;
            return Ok(());
        }
    }

    if let Err(e) = fs_err::tokio::remove_file(local.as_std_path()).await {
        tracing::warn!(task_id, "could not remove the local archive: {e}");
    }
    // The task now blocks in this step until /process_ready arrives.
    ctx.store.set_status(task_id, "processing").await?;
    tracing::info!(task_id, "task awaiting remote processing");
    Ok(())
}

async fn build_processing_request(
    ctx: &StageContext,
    task_id: &str,
    filename: &str,
) -> anyhow::Result<ProcessingRequest> {
    let task = ctx.store.task(task_id).await?;
    let config = ctx.store.app_config().await?;
    let bag = task
        .recon_settings
        .as_deref()
        .map(MetadataBag::from_json)
        .transpose()?
        .context("task has no recon settings")?;
    let series_uid = task.series.clone().context("task has no source series")?;
    let series = ctx
        .store
        .series_by_uid(&series_uid)
        .await?
        .context("source series row is gone")?;
    let study = match &series.study_uid {
        Some(uid) => ctx.store.study_by_uid(uid).await?,
        None => None,
    }
    .context("study row is gone")?;
    let metadata = build_processing_metadata(&bag, &series, &study)?;
    Ok(ProcessingRequest {
        input_file: filename.to_string(),
        client_port: ctx.http_port,
        client_id: config.client_id,
        metadata,
    })
}

/// Assemble the processing-metadata payload of §upload: recon parameters,
/// dose in mCi, injection timestamp and patient biometrics.
pub(crate) fn build_processing_metadata(
    bag: &MetadataBag,
    series: &Series,
    study: &Study,
) -> anyhow::Result<ProcessingMetadata> {
    let (iterations, subsets) =
        vendor::iterations_subsets(bag).map_err(anyhow::Error::msg)?;
    let rf_info = bag.item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0);
    let total_dose = rf_info
        .and_then(|i| i.f64_of(tags::RADIONUCLIDE_TOTAL_DOSE))
        .unwrap_or(0.0);
    let start_time = rf_info
        .and_then(|i| i.str_of(tags::RADIOPHARMACEUTICAL_START_TIME))
        .unwrap_or_default();

    let date_format = format_description!("[year]-[month]-[day]");
    let time_format = format_description!("[hour]:[minute]:[second]");
    let radiopharmaceutical_start = match (series.series_date, format_start_time(start_time)) {
        (Some(date), Some(time)) => format!("{} {time}", date.format(&date_format)?),
        _ => String::new(),
    };

    Ok(ProcessingMetadata {
        ManufacturerModelName: bag
            .str_of(tags::MANUFACTURER_MODEL_NAME)
            .unwrap_or_default()
            .to_string(),
        ReconstructionMethod: bag
            .str_of(tags::RECONSTRUCTION_METHOD)
            .unwrap_or_default()
            .to_string(),
        Iteraciones: iterations,
        Subsets: subsets,
        VoxelSpacing: format!(
            "[{}]",
            bag.f64s_of(tags::PIXEL_SPACING)
                .unwrap_or_default()
                .iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        SliceThickness: bag.f64_of(tags::SLICE_THICKNESS).unwrap_or_default(),
        Radiofarmaco: rf_info
            .and_then(|i| i.str_of(tags::RADIOPHARMACEUTICAL))
            .unwrap_or_default()
            .to_string(),
        HalfLife: rf_info
            .and_then(|i| i.f64_of(tags::RADIONUCLIDE_HALF_LIFE))
            .unwrap_or(0.0),
        // Bq to mCi, rounded to centi-mCi
        radiopharmaceutical_dose: (total_dose / 37_000_000.0 * 100.0).round() / 100.0,
        radiopharmaceutical_start,
        StudyInstanceUID: study.study_uid.clone(),
        SeriesInstanceUID: series.series_uid.clone(),
        StudyDate: study
            .study_date
            .map(|d| d.format(&date_format))
            .transpose()?
            .unwrap_or_default(),
        SeriesTime: series
            .series_date
            .map(|d| d.format(&time_format))
            .transpose()?
            .unwrap_or_default(),
        weight: study.patient_weight.unwrap_or(0.0) as i64,
        height: (100.0 * study.patient_size.unwrap_or(0.0)) as i64,
        age: study
            .patient_age
            .as_deref()
            .and_then(parse_age_years)
            .unwrap_or(0) as i64,
    })
}

/// DICOM TM ("HHMMSS" with optional fraction) to "HH:MM:SS".
fn format_start_time(tm: &str) -> Option<String> {
    let digits = tm.split('.').next()?.trim();
    if digits.len() < 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}:{}:{}", &digits[0..2], &digits[2..4], &digits[4..6]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_bag::TagValue;
    use time::macros::datetime;

    fn sample_bag() -> MetadataBag {
        let mut bag = MetadataBag::default();
        bag.set_str(tags::MANUFACTURER, "SIEMENS");
        bag.set_str(tags::MANUFACTURER_MODEL_NAME, "Biograph128");
        bag.set_str(tags::RECONSTRUCTION_METHOD, "3i21s BSREM");
        bag.insert(tags::PIXEL_SPACING, TagValue::Floats(vec![3.65, 3.65]));
        bag.set_f64(tags::SLICE_THICKNESS, 3.27);
        let mut item = MetadataBag::default();
        item.set_str(tags::RADIOPHARMACEUTICAL, "Fluorodeoxyglucose");
        item.set_f64(tags::RADIONUCLIDE_HALF_LIFE, 6586.2);
        item.set_f64(tags::RADIONUCLIDE_TOTAL_DOSE, 370_000_000.0);
        item.set_str(tags::RADIOPHARMACEUTICAL_START_TIME, "083000.00");
        bag.insert(
            tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE,
            TagValue::Items(vec![item]),
        );
        bag
    }

    fn sample_series() -> Series {
        Series {
            series_uid: "1.2.3.4".to_string(),
            series_date: Some(datetime!(2024-03-05 09:15:00 UTC)),
            series_description: Some("AC PET".to_string()),
            modality: Some("PT".to_string()),
            series_number: Some(3),
            patient_id: Some("P1".to_string()),
            study_uid: Some("1.2.3".to_string()),
            originating_task: None,
            stored_in: None,
        }
    }

    fn sample_study() -> Study {
        Study {
            study_uid: "1.2.3".to_string(),
            study_date: Some(datetime!(2024-03-05 09:00:00 UTC)),
            study_description: None,
            patient_id: Some("P1".to_string()),
            patient_weight: Some(81.4),
            patient_size: Some(1.76),
            patient_age: Some("065Y".to_string()),
            stored_in: None,
        }
    }

    #[test]
    fn test_processing_metadata() {
        let metadata =
            build_processing_metadata(&sample_bag(), &sample_series(), &sample_study()).unwrap();
        assert_eq!(metadata.Iteraciones, 3);
        assert_eq!(metadata.Subsets, 21);
        assert_eq!(metadata.radiopharmaceutical_dose, 10.0);
        assert_eq!(metadata.radiopharmaceutical_start, "2024-03-05 08:30:00");
        assert_eq!(metadata.StudyDate, "2024-03-05");
        assert_eq!(metadata.SeriesTime, "09:15:00");
        assert_eq!(metadata.weight, 81);
        assert_eq!(metadata.height, 176);
        assert_eq!(metadata.age, 65);
    }

    #[test]
    fn test_start_time_without_fraction() {
        assert_eq!(format_start_time("143059"), Some("14:30:59".to_string()));
        assert_eq!(format_start_time(""), None);
        assert_eq!(format_start_time("bad"), None);
    }
}
