//! Unpack stage: apply the configured post-filters to the processed voxels
//! and rebuild DICOM series from the task's instance templates.
use crate::error::TaskStoreError;
use crate::gaussian::gaussian_filter_3d;
use crate::metadata_bag::MetadataBag;
use crate::models::{FilterMode, FilterSettings, Stage};
use crate::pack::archive_name;
use crate::stage::StageContext;
use crate::store_handler::{store_dataset, StoreOutcome};
use crate::uid::new_uid;
use crate::voxels;
use anyhow::Context;
use camino::Utf8PathBuf;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{open_file, DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};
use ndarray::Array3;
use time::macros::format_description;
use time::OffsetDateTime;

pub(crate) async fn handle_task(ctx: &StageContext, task_id: &str) -> Result<(), TaskStoreError> {
    let task = ctx.store.task(task_id).await?;
    let config = ctx.store.app_config().await?;

    // Idempotent restart: drop result series of an earlier attempt.
    let stale_dirs = ctx.store.delete_result_series(task_id).await?;
    for dir in stale_dirs {
        if let Err(e) = fs_err::tokio::remove_dir_all(&dir).await {
            tracing::warn!(task_id, dir, "could not remove stale result series: {e}");
        }
    }

    let filename = archive_name(&task.id, &config.client_id);
    let archive = Utf8PathBuf::from(&config.download_path).join(&filename);
    let extract_dir = Utf8PathBuf::from(&config.unzip_dir)
        .join(filename.trim_end_matches(".zip"));

    ctx.store.set_status(task_id, "unpacking").await?;
    let extracted = {
        let archive = archive.clone();
        let extract_dir = extract_dir.clone();
        tokio::task::spawn_blocking(move || crate::archive::extract_zip(&archive, &extract_dir))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r.map_err(anyhow::Error::from))
    };
    if let Err(e) = extracted {
        tracing::error!(task_id, "could not extract {archive}: {e:#}");
        ctx.store
            .mark_failed(
                task_id,
                "failed - decompression",
                &format!(
                    "An error occurred while decompressing the image data sent by the remote \
                     server. Full error message:\n\n{e:#}"
                ),
            )
            .await?;
        return Ok(());
    }

    // Post-filter selection for this scanner/radiopharmaceutical pair.
    ctx.store.set_status(task_id, "applying post-filters").await?;
    let bag = task
        .recon_settings
        .as_deref()
        .and_then(|json| MetadataBag::from_json(json).ok())
        .unwrap_or_default();
    let model = bag
        .str_of(tags::MANUFACTURER_MODEL_NAME)
        .unwrap_or_default()
        .to_string();
    let rf_label = bag
        .item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
        .and_then(|item| item.str_of(tags::RADIOPHARMACEUTICAL))
        .unwrap_or_default()
        .to_string();
    let Some(filters) = select_filters(ctx, &model, &rf_label).await? else {
        tracing::info!(task_id, model, rf_label, "no post-filter configured for this pair");
        ctx.store
            .mark_failed(
                task_id,
                "failed - no post-filter",
                &format!(
                    "No post-filter is configured for the scanner model \"{model}\" and \
                     radiopharmaceutical \"{rf_label}\". Configure at least one matching \
                     filter and retry this step."
                ),
            )
            .await?;
        return Ok(());
    };

    let template_paths: Vec<Utf8PathBuf> = ctx
        .store
        .task_instances(task_id)
        .await?
        .into_iter()
        .map(|i| Utf8PathBuf::from(i.filename))
        .collect();
    let expected = filters.len() * template_paths.len();

    let built = {
        let extract_dir = extract_dir.clone();
        let filters = filters.clone();
        tokio::task::spawn_blocking(move || build_all_series(&extract_dir, &template_paths, &filters))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r)
    };
    let series = match built {
        Ok(series) => series,
        Err(e) => {
            let missing_npy = e.downcast_ref::<std::io::Error>().is_some_and(|io| {
                io.kind() == std::io::ErrorKind::NotFound
            });
            let (status, full) = if missing_npy {
                (
                    "failed - results not found",
                    "A .npy file was expected in the data sent by the server but was not \
                     found. Contact support."
                        .to_string(),
                )
            } else {
                (
                    "failed - post-filter",
                    format!(
                        "An unexpected error occurred while applying the post-filter to the \
                         result image. Full error message:\n\n{e:#}"
                    ),
                )
            };
            tracing::error!(task_id, "unpack failed: {e:#}");
            ctx.store.mark_failed(task_id, status, &full).await?;
            return Ok(());
        }
    };

    // Store the rebuilt instances and link the new series to this task.
    ctx.store.set_status(task_id, "building dicoms").await?;
    let mut stored = 0usize;
    for (series_uid, datasets) in series {
        for dataset in datasets {
            match store_dataset(&ctx.store, &ctx.incoming_root, dataset).await {
                Ok(StoreOutcome::New) => stored += 1,
                Ok(StoreOutcome::Duplicate) => {
                    tracing::warn!(task_id, series_uid, "rebuilt instance already existed")
                }
                Err(e) => tracing::error!(task_id, series_uid, "could not store result: {e}"),
            }
        }
        ctx.store
            .set_series_originating_task(&series_uid, task_id)
            .await?;
    }

    if stored == expected {
        tracing::info!(task_id, stored, "all result instances stored");
        ctx.store.advance(task_id, Stage::Send, "results stored").await?;
        if let Err(e) = fs_err::tokio::remove_file(archive.as_std_path()).await {
            tracing::warn!(task_id, "could not remove {archive}: {e}");
        }
        if let Err(e) = fs_err::tokio::remove_dir_all(extract_dir.as_std_path()).await {
            tracing::warn!(task_id, "could not remove {extract_dir}: {e}");
        }
    } else {
        tracing::error!(task_id, stored, expected, "not all result instances were stored");
        ctx.store
            .mark_failed(
                task_id,
                "failed - storage",
                &format!(
                    "{expected} result images were expected for this task, but only {stored} \
                     could be written to disk and the task store."
                ),
            )
            .await?;
    }
    Ok(())
}

/// Enabled filters applying to this scanner/radiopharmaceutical pair.
///
/// `Ok(None)` means filters exist but none matches (an operator problem);
/// an empty or fully disabled table falls back to the single identity pass.
async fn select_filters(
    ctx: &StageContext,
    model: &str,
    rf_label: &str,
) -> Result<Option<Vec<FilterSettings>>, TaskStoreError> {
    let enabled: Vec<FilterSettings> = ctx
        .store
        .filter_settings()
        .await?
        .into_iter()
        .filter(|f| f.enabled)
        .collect();
    if enabled.is_empty() {
        return Ok(Some(vec![FilterSettings::identity()]));
    }
    let mut matching = Vec::new();
    for filter in enabled {
        if filter.model != "all" && filter.model != model {
            continue;
        }
        if filter.radiopharmaceutical != "all" {
            match ctx.store.radiopharmaceutical(&filter.radiopharmaceutical).await? {
                Some(rf) if rf.matches(rf_label) => {}
                _ => continue,
            }
        }
        matching.push(filter);
    }
    Ok(if matching.is_empty() { None } else { Some(matching) })
}

/// Load the processed volumes and produce one rebuilt series per filter.
fn build_all_series(
    extract_dir: &Utf8PathBuf,
    template_paths: &[Utf8PathBuf],
    filters: &[FilterSettings],
) -> anyhow::Result<Vec<(String, Vec<DefaultDicomObject>)>> {
    let denoised: Array3<f32> =
        ndarray_npy::read_npy(extract_dir.join("denoised.npy").as_std_path())
            .map_err(npy_not_found)?;
    let noise: Array3<f32> = ndarray_npy::read_npy(extract_dir.join("noise.npy").as_std_path())
        .map_err(npy_not_found)?;
    anyhow::ensure!(
        denoised.dim() == noise.dim(),
        "denoised and noise volumes have different shapes"
    );

    let mut templates = Vec::with_capacity(template_paths.len());
    for path in template_paths {
        templates.push(open_file(path.as_std_path())?);
    }
    anyhow::ensure!(!templates.is_empty(), "task has no instance templates");
    // sort templates bottom slice first, like the quantized planes
    templates.sort_by(|a, b| {
        let za = slice_z(a).unwrap_or(f64::MAX);
        let zb = slice_z(b).unwrap_or(f64::MAX);
        za.partial_cmp(&zb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let voxel_size = template_voxel_size(&templates[0])?;

    let original_description = templates[0]
        .element(tags::SERIES_DESCRIPTION)
        .ok()
        .and_then(|e| e.to_str().ok().map(|s| s.trim().to_string()))
        .unwrap_or_default();

    let mut series = Vec::with_capacity(filters.len());
    for filter in filters {
        let mut volume = &denoised + &(&noise * (filter.noise as f32 / 100.0));
        volume.mapv_inplace(f32::abs);
        let filtered = gaussian_filter_3d(&volume, filter.fwhm, voxel_size);
        let description = match filter.mode {
            FilterMode::Append => format!("{}_{}", original_description, filter.description),
            FilterMode::Replace => filter.description.clone(),
        };
        series.push(build_series(
            filtered,
            &templates,
            filter.series_number,
            &description,
        )?);
    }
    Ok(series)
}

/// Quantize a filtered volume back into the templates, minting new series
/// and instance UIDs.
fn build_series(
    volume_xyz: Array3<f32>,
    templates: &[DefaultDicomObject],
    series_number: i64,
    description: &str,
) -> anyhow::Result<(String, Vec<DefaultDicomObject>)> {
    let slices = voxels::quantize_slices(volume_xyz);
    anyhow::ensure!(
        slices.len() == templates.len(),
        "volume has {} slices but the series has {} templates",
        slices.len(),
        templates.len()
    );

    let series_uid = new_uid();
    let time_format = format_description!("[hour][minute][second]");
    let timenow = OffsetDateTime::now_utc().format(&time_format)?;

    let mut datasets = Vec::with_capacity(templates.len());
    for (template, slice) in templates.iter().zip(slices) {
        let inner: &InMemDicomObject = template;
        let mut ds = inner.clone();
        let sop_uid = new_uid();
        ds.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::from(slice.bytes),
        ));
        ds.put(DataElement::new(
            tags::RESCALE_SLOPE,
            VR::DS,
            PrimitiveValue::from(format!("{:.6e}", slice.slope)),
        ));
        ds.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_uid.as_str()),
        ));
        ds.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid.as_str()),
        ));
        ds.put(DataElement::new(
            tags::SERIES_NUMBER,
            VR::IS,
            PrimitiveValue::from(series_number.to_string()),
        ));
        ds.put(DataElement::new(
            tags::SERIES_DESCRIPTION,
            VR::LO,
            PrimitiveValue::from(description),
        ));
        ds.put(DataElement::new(
            tags::INSTANCE_CREATION_TIME,
            VR::TM,
            PrimitiveValue::from(timenow.as_str()),
        ));
        ds.put(DataElement::new(
            tags::CONTENT_TIME,
            VR::TM,
            PrimitiveValue::from(timenow.as_str()),
        ));

        let sop_class_uid = ds
            .element(tags::SOP_CLASS_UID)
            .ok()
            .and_then(|e| e.to_str().ok().map(|s| s.trim().to_string()))
            .context("template has no SOPClassUID")?;
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uid)
            .media_storage_sop_instance_uid(&sop_uid)
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .build()?;
        datasets.push(ds.with_exact_meta(meta));
    }
    Ok((series_uid, datasets))
}

fn slice_z(obj: &DefaultDicomObject) -> Option<f64> {
    obj.element(tags::IMAGE_POSITION_PATIENT)
        .ok()
        .and_then(|e| e.to_multi_float64().ok())
        .filter(|v| v.len() >= 3)
        .map(|v| v[2])
}

/// Voxel edge lengths in mm, (X, Y, Z) order.
fn template_voxel_size(obj: &DefaultDicomObject) -> anyhow::Result<[f64; 3]> {
    let spacing = obj
        .element(tags::PIXEL_SPACING)
        .ok()
        .and_then(|e| e.to_multi_float64().ok())
        .filter(|v| v.len() >= 2)
        .context("template has no PixelSpacing")?;
    let thickness = obj
        .element(tags::SLICE_THICKNESS)
        .ok()
        .and_then(|e| e.to_float64().ok())
        .context("template has no SliceThickness")?;
    Ok([spacing[0], spacing[1], thickness])
}

/// Keep a missing-file error recognizable through the anyhow chain.
fn npy_not_found(e: ndarray_npy::ReadNpyError) -> anyhow::Error {
    match e {
        ndarray_npy::ReadNpyError::Io(io) => anyhow::Error::from(io),
        other => anyhow::Error::from(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{synthetic_pet_slice, SyntheticSlice};

    fn write_templates(root: &Utf8PathBuf) -> Vec<Utf8PathBuf> {
        let mut paths = Vec::new();
        for (sop, z) in [("t1", 0.0), ("t2", 3.27), ("t3", 6.54)] {
            let obj = synthetic_pet_slice(SyntheticSlice {
                sop_uid: sop,
                series_uid: "src-series",
                study_uid: "st1",
                z,
                rows: 2,
                columns: 3,
                pixels: vec![10; 6],
                rescale_slope: 1.0,
            });
            let path = root.join(format!("{sop}.dcm"));
            obj.write_to_file(path.as_std_path()).unwrap();
            paths.push(path);
        }
        paths
    }

    #[test]
    fn test_identity_filter_rebuilds_the_series() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let templates = write_templates(&root);

        let denoised = Array3::from_shape_fn((3, 2, 3), |(x, y, z)| {
            1000.0 + (x * 100 + y * 10 + z) as f32
        });
        let noise = Array3::<f32>::zeros((3, 2, 3));
        ndarray_npy::write_npy(root.join("denoised.npy").as_std_path(), &denoised).unwrap();
        ndarray_npy::write_npy(root.join("noise.npy").as_std_path(), &noise).unwrap();

        let filter = crate::models::FilterSettings {
            fwhm: 0.0,
            noise: 0.0,
            description: "smooth".to_string(),
            mode: FilterMode::Append,
            series_number: 1001,
            ..crate::models::FilterSettings::identity()
        };
        let series = build_all_series(&root, &templates, std::slice::from_ref(&filter)).unwrap();
        assert_eq!(series.len(), 1);
        let (series_uid, datasets) = &series[0];
        assert_eq!(datasets.len(), templates.len());
        assert!(series_uid.starts_with("2.25."));

        for (index, ds) in datasets.iter().enumerate() {
            assert_eq!(
                ds.element(tags::SERIES_DESCRIPTION).unwrap().to_str().unwrap(),
                "AC PET_smooth"
            );
            assert_eq!(
                ds.element(tags::SERIES_NUMBER).unwrap().to_int::<i64>().unwrap(),
                1001
            );
            assert_eq!(
                ds.element(tags::SERIES_INSTANCE_UID).unwrap().to_str().unwrap(),
                series_uid.as_str()
            );
            let sop_uid = ds
                .element(tags::SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .to_string();
            assert!(sop_uid.starts_with("2.25."), "freshly minted SOP UID");

            // quantization round trip: stored * slope within one slope step
            let slope = ds
                .element(tags::RESCALE_SLOPE)
                .unwrap()
                .to_float64()
                .unwrap();
            let bytes = ds.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
            for (pixel, pair) in bytes.chunks_exact(2).enumerate() {
                let stored = u16::from_le_bytes([pair[0], pair[1]]) as f64;
                let y = pixel / 3;
                let x = pixel % 3;
                let expected = denoised[[x, y, index]] as f64;
                assert!(
                    (stored * slope - expected).abs() <= slope,
                    "slice {index} pixel {pixel}: {} vs {expected}",
                    stored * slope
                );
            }
        }
    }

    #[test]
    fn test_missing_noise_volume_reads_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let templates = write_templates(&root);
        let denoised = Array3::<f32>::zeros((3, 2, 3));
        ndarray_npy::write_npy(root.join("denoised.npy").as_std_path(), &denoised).unwrap();

        let err = build_all_series(
            &root,
            &templates,
            &[crate::models::FilterSettings::identity()],
        )
        .unwrap_err();
        let is_not_found = err
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
        assert!(is_not_found, "unexpected error: {err:#}");
    }
}
