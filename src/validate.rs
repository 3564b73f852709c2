//! Validate stage: destination selection, vendor header checks, remote
//! model availability.
use crate::error::TaskStoreError;
use crate::metadata_bag::MetadataBag;
use crate::models::{Device, Stage, Task};
use crate::remote::{CheckModelOutcome, CheckModelRequest};
use crate::stage::StageContext;
use crate::task_store::TaskStore;
use crate::vendor;
use dicom::dictionary_std::tags;

pub(crate) async fn handle_task(ctx: &StageContext, task_id: &str) -> Result<(), TaskStoreError> {
    let task = ctx.store.task(task_id).await?;
    ctx.store.set_status(task_id, "validating").await?;

    // Destinations: configured destination devices, plus the source device
    // in mirror mode.
    let destinations = select_destinations(&ctx.store, &task).await?;
    if destinations.is_empty() {
        tracing::error!(task_id, "no destination for this task");
        ctx.store
            .mark_failed(
                task_id,
                "failed - no destination",
                "This task cannot continue because there is no destination configured for the \
                 result series. Check the remote DICOM device configuration and make sure at \
                 least one device is marked as a destination, or that mirror mode is active and \
                 the source device of this task is declared.",
            )
            .await?;
        return Ok(());
    }
    let names: Vec<String> = destinations.into_iter().map(|d| d.name).collect();
    ctx.store.add_task_destinations(task_id, &names).await?;

    // Header check, with vendor patches applied to the stored settings.
    let mut bag = match task.recon_settings.as_deref().map(MetadataBag::from_json) {
        Some(Ok(bag)) => bag,
        _ => {
            ctx.store
                .mark_failed(
                    task_id,
                    "failed - DICOM info",
                    "The reconstruction settings of this task are unreadable. Restart the task \
                     by re-sending the original series.",
                )
                .await?;
            return Ok(());
        }
    };
    if let Err(issue) = vendor::check_header(&mut bag) {
        tracing::info!(task_id, "header check failed: {issue}");
        ctx.store
            .mark_failed(
                task_id,
                "failed - DICOM info",
                &format!(
                    "This task cannot continue because information is missing or invalid in the \
                     DICOM header. {issue}"
                ),
            )
            .await?;
        return Ok(());
    }
    // persist any vendor patch so later stages see the same settings
    let json = bag.to_json().unwrap_or_default();
    ctx.store.update_recon_settings(task_id, &json).await?;

    // Radiopharmaceutical resolution against the synonym table.
    let rf_label = bag
        .item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
        .and_then(|item| item.str_of(tags::RADIOPHARMACEUTICAL))
        .unwrap_or_default()
        .to_string();
    let known = ctx.store.radiopharmaceuticals().await?;
    let Some(matched) = known.iter().find(|r| r.matches(&rf_label)) else {
        tracing::info!(task_id, rf_label, "unknown radiopharmaceutical");
        ctx.store
            .mark_failed(
                task_id,
                "failed - unknown radiopharmaceutical",
                &format!(
                    "The DICOM header of this task has an unknown value (\"{rf_label}\") in the \
                     Radiopharmaceutical field. Add a new radiopharmaceutical carrying this \
                     identification, or add it as a synonym of an existing one \
                     (comma-separated values), then retry this step."
                ),
            )
            .await?;
        return Ok(());
    };
    ctx.store
        .set_task_radiopharmaceutical(task_id, &matched.name)
        .await?;

    // Remote capability check.
    let (iterations, subsets) = match vendor::iterations_subsets(&bag) {
        Ok(pair) => pair,
        Err(message) => {
            ctx.store
                .mark_failed(
                    task_id,
                    "failed - DICOM info",
                    &format!(
                        "This task cannot continue because information is missing or invalid in \
                         the DICOM header. {message}"
                    ),
                )
                .await?;
            return Ok(());
        }
    };
    let request = CheckModelRequest {
        id_client: ctx.store.app_config().await?.client_id,
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
        VoxelSpacing: format_voxel_spacing(&bag),
        SliceThickness: bag.f64_of(tags::SLICE_THICKNESS).unwrap_or_default(),
        Radiofarmaco: rf_label,
        HalfLife: bag
            .item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
            .and_then(|item| item.f64_of(tags::RADIONUCLIDE_HALF_LIFE))
            .unwrap_or(matched.half_life.unwrap_or_default()),
    };
    if ctx.server_interaction {
        let config = ctx.store.app_config().await?;
        match ctx.remote.check_model(&config.server_url, &request).await {
            CheckModelOutcome::Accepted => {}
            CheckModelOutcome::Rejected { code, message } => {
                tracing::info!(task_id, code, "server rejected the task");
                ctx.store
                    .mark_failed(
                        task_id,
                        "failed - rejected",
                        &format!("The remote server rejected this task: {message}"),
                    )
                    .await?;
                return Ok(());
            }
            CheckModelOutcome::ConnectionFailed(detail) => {
                tracing::info!(task_id, "server connection failed: {detail}");
                ctx.store
                    .mark_failed(
                        task_id,
                        "failed - server connection",
                        "There is no connection to the remote server. Check the internet \
                         connection of the device running this application; if the problem \
                         persists, contact support.",
                    )
                    .await?;
                return Ok(());
            }
            CheckModelOutcome::BadResponse(detail) => {
                tracing::info!(task_id, "bad server response: {detail}");
                ctx.store
                    .mark_failed(
                        task_id,
                        "failed - server",
                        "The remote server sent a message that could not be understood. \
                         Contact support.",
                    )
                    .await?;
                return Ok(());
            }
        }
    } else {
        tracing::debug!(task_id, "server interaction disabled; model check skipped");
    }

    // Remember this scanner model.
    if let Some(model) = bag.str_of(tags::MANUFACTURER_MODEL_NAME) {
        ctx.store.register_pet_model(model).await?;
    }

    ctx.store.advance(task_id, Stage::Pack, "validated").await?;
    tracing::info!(task_id, "task validated");
    Ok(())
}

/// Union of configured destinations and, in mirror mode, the device(s)
/// matching the source IP (narrowed by AET when several match).
pub(crate) async fn select_destinations(
    store: &TaskStore,
    task: &Task,
) -> Result<Vec<Device>, TaskStoreError> {
    let mut destinations = store.destination_devices().await?;
    let mirror_mode = store.app_config().await?.mirror_mode;
    if mirror_mode {
        if let Some((aet, ip)) = task.source.as_deref().and_then(|s| s.split_once('@')) {
            let matching_ip = store.devices_by_address(ip).await?;
            if matching_ip.len() <= 1 {
                destinations.extend(matching_ip);
            } else {
                let matching_aet = store.devices_by_address_and_aet(ip, aet).await?;
                if matching_aet.is_empty() {
                    destinations.extend(matching_ip);
                } else {
                    destinations.extend(matching_aet);
                }
            }
        }
    }
    destinations.sort_by(|a, b| a.name.cmp(&b.name));
    destinations.dedup_by(|a, b| a.name == b.name);
    Ok(destinations)
}

/// PixelSpacing the way the server expects it: `"[row, col]"`.
fn format_voxel_spacing(bag: &MetadataBag) -> String {
    let spacing = bag.f64s_of(tags::PIXEL_SPACING).unwrap_or_default();
    format!(
        "[{}]",
        spacing
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_bag::TagValue;
    use crate::models::{AppConfig, StepState};
    use time::OffsetDateTime;

    #[test]
    fn test_format_voxel_spacing() {
        let mut bag = MetadataBag::default();
        bag.insert(tags::PIXEL_SPACING, TagValue::Floats(vec![3.65, 3.65]));
        assert_eq!(format_voxel_spacing(&bag), "[3.65, 3.65]");
    }

    fn task_from(source: &str) -> Task {
        Task {
            id: "t1".to_string(),
            started: OffsetDateTime::UNIX_EPOCH,
            updated: OffsetDateTime::UNIX_EPOCH,
            current_step: Stage::Validate,
            recon_settings: None,
            step_state: StepState::Processing,
            status_msg: None,
            full_status_msg: None,
            imgs: 0,
            expected_imgs: None,
            visible: true,
            series: Some("s1".to_string()),
            source: Some(source.to_string()),
            radiopharmaceutical: None,
        }
    }

    fn app_config(mirror_mode: bool) -> AppConfig {
        AppConfig {
            client_id: "clinic-a".to_string(),
            min_instances_in_series: 47,
            slice_gap_tolerance: 0.025,
            series_timeout: 30,
            store_scp_port: 11113,
            store_scp_aet: "PETRELAY".to_string(),
            ip_address: String::new(),
            mirror_mode,
            server_url: "10.0.0.1:5000".to_string(),
            shared_mount_point: "shared".to_string(),
            zip_dir: "temp/packed_series".to_string(),
            unzip_dir: "temp/unpacked_series".to_string(),
            download_path: "temp/series_to_unpack".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mirror_mode_adds_the_source_device() {
        // no device is marked as a destination, but the source IP matches
        // exactly one configured device
        let store = TaskStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_app_config(&app_config(true)).await.unwrap();
        store
            .add_device(&Device {
                name: "Scanner1".to_string(),
                ae_title: "AET1".to_string(),
                address: "10.1.1.1".to_string(),
                port: 104,
                is_destination: false,
            })
            .await
            .unwrap();

        let destinations = select_destinations(&store, &task_from("AET1@10.1.1.1"))
            .await
            .unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].name, "Scanner1");
    }

    #[tokio::test]
    async fn test_mirror_mode_prefers_the_aet_match() {
        let store = TaskStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_app_config(&app_config(true)).await.unwrap();
        for (name, aet) in [("Scanner1", "AET1"), ("Workstation", "WS1")] {
            store
                .add_device(&Device {
                    name: name.to_string(),
                    ae_title: aet.to_string(),
                    address: "10.1.1.1".to_string(),
                    port: 104,
                    is_destination: false,
                })
                .await
                .unwrap();
        }
        let destinations = select_destinations(&store, &task_from("AET1@10.1.1.1"))
            .await
            .unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].name, "Scanner1");
    }

    #[tokio::test]
    async fn test_without_mirror_mode_only_destinations_count() {
        let store = TaskStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_app_config(&app_config(false)).await.unwrap();
        store
            .add_device(&Device {
                name: "Scanner1".to_string(),
                ae_title: "AET1".to_string(),
                address: "10.1.1.1".to_string(),
                port: 104,
                is_destination: false,
            })
            .await
            .unwrap();
        let destinations = select_destinations(&store, &task_from("AET1@10.1.1.1"))
            .await
            .unwrap();
        assert!(destinations.is_empty());
    }
}
