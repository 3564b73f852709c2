//! Compile stage: groups received instances of the same (series, source)
//! into a task and decides when the series is complete enough to advance.
use crate::error::HandleLoopError;
use crate::extract;
use crate::metadata_bag::MetadataBag;
use crate::models::{AppConfig, Stage, StepState, Task};
use crate::store_handler::StoreEvent;
use crate::task_id;
use crate::task_store::TaskStore;
use camino::Utf8PathBuf;
use dicom::dictionary_std::tags;
use dicom::object::open_file;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Sweep once the queue has been idle this long.
const SWEEP_AFTER_IDLE: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Thresholds deciding when a series counts as complete.
#[derive(Debug, Clone)]
pub(crate) struct CompletionPolicy {
    pub min_instances: i64,
    pub timeout: Duration,
    pub gap_tolerance: f64,
}

impl From<&AppConfig> for CompletionPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_instances: config.min_instances_in_series,
            timeout: Duration::from_secs(config.series_timeout.max(0) as u64),
            gap_tolerance: config.slice_gap_tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SeriesStatus {
    Completed,
    Wait,
    Abort(String),
}

/// Decide the outcome for a series with slices at the given Z positions.
///
/// The instance-count criterion rules while `expected` is known and matches;
/// contiguity can only complete a series after the timeout has elapsed.
pub(crate) fn series_status(
    z_positions: &[f64],
    expected: Option<i64>,
    last_updated: OffsetDateTime,
    now: OffsetDateTime,
    policy: &CompletionPolicy,
) -> SeriesStatus {
    let received = z_positions.len() as i64;
    let timed_out = (now - last_updated) > policy.timeout;

    if let Some(expected) = expected.filter(|n| *n == received) {
        if expected >= policy.min_instances {
            return SeriesStatus::Completed;
        }
        if timed_out {
            return SeriesStatus::Abort(format!(
                "Only {received} images were received after a waiting period of {}s. \
                 Only series with {} or more images can be processed.",
                policy.timeout.as_secs(),
                policy.min_instances
            ));
        }
        return SeriesStatus::Wait;
    }

    if timed_out {
        if received < policy.min_instances {
            return SeriesStatus::Abort(format!(
                "Only {received} images were received after a waiting period of {}s. \
                 Only series with {} or more images can be processed.",
                policy.timeout.as_secs(),
                policy.min_instances
            ));
        }
        if contiguous(z_positions, policy.gap_tolerance) {
            return SeriesStatus::Completed;
        }
        return SeriesStatus::Abort(format!(
            "The series can't be processed because separation between consecutive slices \
             varies by more than {} of the mean gap (or there are missing slices).",
            policy.gap_tolerance
        ));
    }
    SeriesStatus::Wait
}

/// Whether slices are regularly sampled in Z: every adjacent gap within
/// `tolerance` of the mean gap.
pub(crate) fn contiguous(z_positions: &[f64], tolerance: f64) -> bool {
    if z_positions.len() < 2 {
        return false;
    }
    let gaps = sorted_gaps(z_positions);
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let min = gaps.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = gaps.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    min >= (1.0 - tolerance) * mean && max <= (1.0 + tolerance) * mean
}

/// Mean adjacent gap of the sorted Z positions.
pub(crate) fn mean_gap(z_positions: &[f64]) -> f64 {
    let gaps = sorted_gaps(z_positions);
    if gaps.is_empty() {
        return 0.0;
    }
    gaps.iter().sum::<f64>() / gaps.len() as f64
}

fn sorted_gaps(z_positions: &[f64]) -> Vec<f64> {
    let mut sorted = z_positions.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Pick the canonical recon settings for a completed series: the instance
/// with the longest ActualFrameDuration, with the mean Z gap recorded as
/// SpacingBetweenSlices.
pub(crate) fn summarize_recon(slices: &[(f64, MetadataBag)]) -> MetadataBag {
    let mut canonical = slices
        .iter()
        .max_by(|a, b| {
            let fa = a.1.f64_of(tags::ACTUAL_FRAME_DURATION).unwrap_or(f64::MIN);
            let fb = b.1.f64_of(tags::ACTUAL_FRAME_DURATION).unwrap_or(f64::MIN);
            fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(_, bag)| bag.clone())
        .unwrap_or_default();
    let z_positions: Vec<f64> = slices.iter().map(|(z, _)| *z).collect();
    canonical.set_f64(tags::SPACING_BETWEEN_SLICES, mean_gap(&z_positions));
    canonical
}

/// The compile loop: drains instance events into tasks, and after five
/// seconds of inactivity sweeps every (compile, processing) task through
/// [series_status].
pub(crate) async fn compile_stage_loop(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<StoreEvent>,
    store: TaskStore,
    cancel: CancellationToken,
) -> Result<(), HandleLoopError> {
    let mut inactive_seconds = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                inactive_seconds = 0;
                while let Err(e) = on_instance(&store, &event).await {
                    tracing::error!(sop_uid = event.sop_uid, "compile could not record instance: {e}");
                    if cancel.is_cancelled() {
                        return Err(HandleLoopError("compile stage interrupted mid-instance"));
                    }
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                inactive_seconds += 1;
                if inactive_seconds >= SWEEP_AFTER_IDLE {
                    inactive_seconds = 0;
                    if let Err(e) = sweep(&store).await {
                        tracing::error!("compile sweep failed: {e}");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Attach the instance to a matching open task or create a new one.
async fn on_instance(store: &TaskStore, event: &StoreEvent) -> Result<(), crate::error::TaskStoreError> {
    let source_id = event.source.identifier();
    store.upsert_source(&source_id).await?;
    match store
        .compile_candidate(&event.series_uid, &source_id, &event.sop_uid)
        .await?
    {
        Some(task) => {
            tracing::debug!(task_id = task.id, sop_uid = event.sop_uid, "appending instance");
            store.append_task_instance(&task.id, &event.sop_uid).await
        }
        None => {
            let id = task_id::generate();
            tracing::info!(task_id = id, series_uid = event.series_uid, "creating new task");
            store
                .create_task(
                    &id,
                    &event.series_uid,
                    &source_id,
                    event.number_of_slices,
                    &event.sop_uid,
                )
                .await
        }
    }
}

async fn sweep(store: &TaskStore) -> Result<(), crate::error::TaskStoreError> {
    let config = store.app_config().await?;
    let policy = CompletionPolicy::from(&config);
    let now = OffsetDateTime::now_utc();
    for task in store.tasks_in(Stage::Compile, StepState::Processing).await? {
        let slices = match fetch_task_data(store, &task).await {
            Ok(slices) => slices,
            Err(e) => {
                tracing::error!(task_id = task.id, "could not read task data: {e}");
                store
                    .mark_failed(
                        &task.id,
                        "Failed - task data not found",
                        "The original DICOM files of this task were not found. Please delete \
                         the task and start it again by sending the original DICOM series from \
                         the remote device.",
                    )
                    .await?;
                continue;
            }
        };
        let z_positions: Vec<f64> = slices.iter().map(|(z, _)| *z).collect();
        match series_status(&z_positions, task.expected_imgs, task.updated, now, &policy) {
            SeriesStatus::Completed => {
                let recon = summarize_recon(&slices);
                let json = recon.to_json().unwrap_or_default();
                tracing::info!(task_id = task.id, imgs = slices.len(), "series complete");
                store.complete_compile(&task.id, &json).await?;
            }
            SeriesStatus::Abort(msg) => {
                tracing::info!(task_id = task.id, "series timed out");
                store.mark_failed(&task.id, "Failed - timed out", &msg).await?;
            }
            SeriesStatus::Wait => {
                tracing::debug!(task_id = task.id, imgs = slices.len(), "waiting for more instances");
            }
        }
    }
    Ok(())
}

/// Re-read the task's instance files, yielding each slice's Z position and
/// recon metadata.
async fn fetch_task_data(
    store: &TaskStore,
    task: &Task,
) -> Result<Vec<(f64, MetadataBag)>, anyhow::Error> {
    let paths: Vec<Utf8PathBuf> = store
        .task_instances(&task.id)
        .await?
        .into_iter()
        .map(|i| Utf8PathBuf::from(i.filename))
        .collect();
    tokio::task::spawn_blocking(move || {
        paths
            .iter()
            .map(|path| {
                let obj = open_file(path.as_std_path())?;
                let essential = extract::extract_essential(&obj)?;
                Ok((essential.z_position, extract::extract_recon(&obj)))
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use time::macros::datetime;

    fn policy() -> CompletionPolicy {
        CompletionPolicy {
            min_instances: 3,
            timeout: Duration::from_secs(30),
            gap_tolerance: 0.025,
        }
    }

    fn zs(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * 3.27).collect()
    }

    const T0: OffsetDateTime = datetime!(2024-03-05 12:00:00 UTC);

    #[test]
    fn test_completes_on_matching_count() {
        // S1: expected count reached and above the minimum
        let status = series_status(&zs(3), Some(3), T0, T0 + Duration::from_secs(1), &policy());
        assert_eq!(status, SeriesStatus::Completed);
    }

    #[test]
    fn test_waits_before_timeout() {
        let status = series_status(&zs(2), Some(47), T0, T0 + Duration::from_secs(10), &policy());
        assert_eq!(status, SeriesStatus::Wait);
    }

    #[test]
    fn test_aborts_after_timeout_below_minimum() {
        // S2: two instances, expectation never met, timeout elapsed
        let status = series_status(&zs(2), Some(47), T0, T0 + Duration::from_secs(31), &policy());
        assert!(matches!(status, SeriesStatus::Abort(_)));
    }

    #[test]
    fn test_contiguity_completes_after_timeout_without_expectation() {
        let status = series_status(&zs(5), None, T0, T0 + Duration::from_secs(31), &policy());
        assert_eq!(status, SeriesStatus::Completed);
    }

    #[test]
    fn test_gap_break_aborts_after_timeout() {
        let mut z = zs(5);
        z.remove(2); // missing slice doubles one gap
        let status = series_status(&z, None, T0, T0 + Duration::from_secs(31), &policy());
        assert!(matches!(status, SeriesStatus::Abort(_)));
    }

    #[rstest]
    #[case(&[0.0, 3.27, 6.54, 9.81], true)]
    #[case(&[9.81, 0.0, 6.54, 3.27], true)] // order does not matter
    #[case(&[0.0, 3.27, 6.54, 13.08], false)] // missing slice
    #[case(&[0.0, 3.2, 6.54, 9.81], false)] // uneven sampling
    #[case(&[0.0], false)]
    fn test_contiguous(#[case] z: &[f64], #[case] expected: bool) {
        assert_eq!(contiguous(z, 0.025), expected);
    }

    #[test]
    fn test_mean_gap_of_unsorted_positions() {
        let gap = mean_gap(&[6.6, 0.0, 3.3]);
        assert!((gap - 3.3).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_picks_longest_frame_duration() {
        let mut short = MetadataBag::default();
        short.set_f64(tags::ACTUAL_FRAME_DURATION, 1000.0);
        short.set_str(tags::MANUFACTURER, "SHORT");
        let mut long = MetadataBag::default();
        long.set_f64(tags::ACTUAL_FRAME_DURATION, 90000.0);
        long.set_str(tags::MANUFACTURER, "LONG");

        let canonical = summarize_recon(&[(0.0, short), (3.3, long.clone()), (6.6, long)]);
        assert_eq!(canonical.str_of(tags::MANUFACTURER), Some("LONG"));
        let spacing = canonical.f64_of(tags::SPACING_BETWEEN_SLICES).unwrap();
        assert!((spacing - 3.3).abs() < 1e-9);
    }
}

#[cfg(test)]
mod flow_tests {
    use super::*;
    use crate::dicom_settings::ClientAETitle;
    use crate::store_handler::{store_dataset, SourceId, StoreEvent};
    use crate::testing::{synthetic_pet_slice, SyntheticSlice};
    use camino::Utf8PathBuf;

    fn test_config() -> crate::models::AppConfig {
        crate::models::AppConfig {
            client_id: "clinic-a".to_string(),
            min_instances_in_series: 3,
            slice_gap_tolerance: 0.025,
            series_timeout: 30,
            store_scp_port: 11113,
            store_scp_aet: "PETRELAY".to_string(),
            ip_address: String::new(),
            mirror_mode: false,
            server_url: "10.0.0.1:5000".to_string(),
            shared_mount_point: "shared".to_string(),
            zip_dir: "temp/packed_series".to_string(),
            unzip_dir: "temp/unpacked_series".to_string(),
            download_path: "temp/series_to_unpack".to_string(),
        }
    }

    /// Three instances of one series from one source become a single task,
    /// and the next sweep advances it to validate.
    #[tokio::test]
    async fn test_full_series_advances_on_sweep() {
        let store = TaskStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_app_config(&test_config()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let source = SourceId {
            aet: ClientAETitle::from("AET1"),
            ip: "10.1.1.1".to_string(),
        };
        for (sop, z) in [("sop-1", 0.0), ("sop-2", 3.27), ("sop-3", 6.54)] {
            let obj = synthetic_pet_slice(SyntheticSlice {
                sop_uid: sop,
                series_uid: "series-1",
                study_uid: "study-1",
                z,
                rows: 2,
                columns: 2,
                pixels: vec![5, 6, 7, 8],
                rescale_slope: 1.0,
            });
            store_dataset(&store, &root, obj).await.unwrap();
            let event = StoreEvent {
                series_uid: "series-1".to_string(),
                sop_uid: sop.to_string(),
                number_of_slices: Some(3),
                source: source.clone(),
            };
            on_instance(&store, &event).await.unwrap();
        }

        let open = store.tasks_in(Stage::Compile, StepState::Processing).await.unwrap();
        assert_eq!(open.len(), 1, "all instances land in one task");
        assert_eq!(open[0].imgs, 3);
        assert_eq!(open[0].expected_imgs, Some(3));
        assert_eq!(open[0].status_msg.as_deref(), Some("receiving"));

        sweep(&store).await.unwrap();

        assert!(store
            .tasks_in(Stage::Compile, StepState::Processing)
            .await
            .unwrap()
            .is_empty());
        let task = store.task(&open[0].id).await.unwrap();
        assert_eq!(task.current_step, Stage::Validate);
        assert_eq!(task.step_state, StepState::StepDone);

        let bag = MetadataBag::from_json(task.recon_settings.as_deref().unwrap()).unwrap();
        let spacing = bag
            .f64_of(dicom::dictionary_std::tags::SPACING_BETWEEN_SLICES)
            .unwrap();
        assert!((spacing - 3.27).abs() < 1e-6);
        assert_eq!(
            bag.str_of(dicom::dictionary_std::tags::MANUFACTURER),
            Some("SIEMENS")
        );
    }

    /// A duplicate push of an instance the task already holds opens a second
    /// task instead of growing the first.
    #[tokio::test]
    async fn test_repushed_instance_starts_a_new_task() {
        let store = TaskStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_app_config(&test_config()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let source = SourceId {
            aet: ClientAETitle::from("AET1"),
            ip: "10.1.1.1".to_string(),
        };
        let obj = synthetic_pet_slice(SyntheticSlice {
            sop_uid: "sop-1",
            series_uid: "series-1",
            study_uid: "study-1",
            z: 0.0,
            rows: 2,
            columns: 2,
            pixels: vec![5, 6, 7, 8],
            rescale_slope: 1.0,
        });
        store_dataset(&store, &root, obj).await.unwrap();
        let event = StoreEvent {
            series_uid: "series-1".to_string(),
            sop_uid: "sop-1".to_string(),
            number_of_slices: Some(3),
            source,
        };
        on_instance(&store, &event).await.unwrap();
        on_instance(&store, &event).await.unwrap();

        let open = store.tasks_in(Stage::Compile, StepState::Processing).await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|t| t.imgs == 1));
    }
}
