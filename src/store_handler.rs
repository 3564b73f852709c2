//! Persists received datasets to disk and the task store, and feeds the
//! compile stage.
use crate::dicom_settings::ClientAETitle;
use crate::error::DicomStorageError;
use crate::extract;
use crate::task_store::TaskStore;
use crate::transfer::PET_IMAGE_STORAGE;
use camino::Utf8PathBuf;
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use tokio::sync::mpsc::UnboundedSender;

/// Identity of the device an instance came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SourceId {
    pub aet: ClientAETitle,
    pub ip: String,
}

impl SourceId {
    pub fn identifier(&self) -> String {
        format!("{}@{}", self.aet, self.ip)
    }
}

/// One stored instance, announced to the compile stage.
#[derive(Debug, Clone)]
pub(crate) struct StoreEvent {
    pub series_uid: String,
    pub sop_uid: String,
    pub number_of_slices: Option<i64>,
    pub source: SourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreOutcome {
    New,
    Duplicate,
}

#[derive(Clone)]
pub(crate) struct StoreHandler {
    store: TaskStore,
    incoming_root: Utf8PathBuf,
    compile_tx: UnboundedSender<StoreEvent>,
}

impl StoreHandler {
    pub fn new(
        store: TaskStore,
        incoming_root: Utf8PathBuf,
        compile_tx: UnboundedSender<StoreEvent>,
    ) -> Self {
        Self {
            store,
            incoming_root,
            compile_tx,
        }
    }

    /// Handle one C-STORE dataset, returning the DICOM status to answer with.
    ///
    /// Instances of SOP classes other than PET Image Storage are acknowledged
    /// with success but discarded.
    pub async fn handle_cstore(&self, obj: DefaultDicomObject, source: SourceId) -> u16 {
        let sop_class_uid = match obj
            .element(tags::SOP_CLASS_UID)
            .ok()
            .and_then(|e| e.string().ok())
        {
            Some(uid) => uid.trim_end_matches(['\0', ' ']).to_string(),
            None => {
                tracing::error!("received dataset without a readable SOPClassUID");
                return 0xC210;
            }
        };
        if sop_class_uid != PET_IMAGE_STORAGE {
            tracing::debug!(sop_class_uid, "ignoring non-PET instance");
            return 0x0000;
        }

        let essential = match extract::extract_essential(&obj) {
            Ok(essential) => essential,
            Err(e) => {
                tracing::error!("refusing dataset: {e}");
                return 0xA700;
            }
        };

        match self.store_dataset(obj).await {
            Ok(StoreOutcome::New) => {
                tracing::info!(
                    sop_uid = essential.sop_uid,
                    series_uid = essential.series_uid,
                    "instance stored"
                );
            }
            Ok(StoreOutcome::Duplicate) => {
                tracing::debug!(sop_uid = essential.sop_uid, "duplicate instance");
            }
            Err(e) => {
                tracing::error!(sop_uid = essential.sop_uid, "storage failed: {e}");
                return 0xA700;
            }
        }

        let event = StoreEvent {
            series_uid: essential.series_uid,
            sop_uid: essential.sop_uid,
            number_of_slices: essential.number_of_slices,
            source,
        };
        if self.compile_tx.send(event).is_err() {
            tracing::error!("compile stage is gone; instance stored but not compiled");
        }
        0x0000
    }

    pub async fn store_dataset(
        &self,
        obj: DefaultDicomObject,
    ) -> Result<StoreOutcome, DicomStorageError> {
        store_dataset(&self.store, &self.incoming_root, obj).await
    }
}

/// Persist a dataset under `{incoming}/{StudyUID}/{SeriesUID}/{SOPUID}` and
/// upsert its Patient/Study/Series/Instance rows. A duplicate instance
/// refreshes the rows but skips the disk write.
pub(crate) async fn store_dataset(
    store: &TaskStore,
    incoming_root: &camino::Utf8Path,
    obj: DefaultDicomObject,
) -> Result<StoreOutcome, DicomStorageError> {
    let record = extract::instance_record(&obj, incoming_root)?;
    if store.instance_exists(&record.sop_uid).await? {
        store.upsert_instance_tree(&record).await?;
        return Ok(StoreOutcome::Duplicate);
    }
    let filename = record.filename.clone();
    let series_dir = record.series_dir.clone();
    tokio::task::spawn_blocking(move || {
        fs_err::create_dir_all(series_dir.as_std_path())?;
        obj.write_to_file(&filename)?;
        Ok::<(), DicomStorageError>(())
    })
    .await??;
    let inserted = store.upsert_instance_tree(&record).await?;
    Ok(if inserted {
        StoreOutcome::New
    } else {
        StoreOutcome::Duplicate
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::TaskStore;
    use crate::testing::{synthetic_pet_slice, SyntheticSlice};
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::uids;
    use tokio::sync::mpsc::unbounded_channel;

    fn slice(sop: &str, z: f64) -> dicom::object::DefaultDicomObject {
        synthetic_pet_slice(SyntheticSlice {
            sop_uid: sop,
            series_uid: "series-1",
            study_uid: "study-1",
            z,
            rows: 2,
            columns: 2,
            pixels: vec![1, 2, 3, 4],
            rescale_slope: 1.0,
        })
    }

    fn source() -> SourceId {
        SourceId {
            aet: ClientAETitle::from("AET1"),
            ip: "10.1.1.1".to_string(),
        }
    }

    async fn handler() -> (
        StoreHandler,
        tokio::sync::mpsc::UnboundedReceiver<StoreEvent>,
        TaskStore,
        tempfile::TempDir,
    ) {
        let store = TaskStore::connect("sqlite::memory:").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let (tx, rx) = unbounded_channel();
        (StoreHandler::new(store.clone(), root, tx), rx, store, dir)
    }

    #[tokio::test]
    async fn test_cstore_persists_and_feeds_compile() {
        let (handler, mut rx, store, dir) = handler().await;
        let status = handler.handle_cstore(slice("sop-1", 0.0), source()).await;
        assert_eq!(status, 0x0000);
        assert!(store.instance_exists("sop-1").await.unwrap());
        assert!(dir.path().join("study-1/series-1/sop-1").exists());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.series_uid, "series-1");
        assert_eq!(event.sop_uid, "sop-1");
        assert_eq!(event.number_of_slices, Some(3));
        assert_eq!(event.source.identifier(), "AET1@10.1.1.1");
    }

    #[tokio::test]
    async fn test_duplicate_is_acknowledged_without_rewrite() {
        let (handler, mut rx, _store, dir) = handler().await;
        assert_eq!(handler.handle_cstore(slice("sop-1", 0.0), source()).await, 0x0000);
        let file = dir.path().join("study-1/series-1/sop-1");
        let first_mtime = file.metadata().unwrap().modified().unwrap();

        assert_eq!(handler.handle_cstore(slice("sop-1", 0.0), source()).await, 0x0000);
        assert_eq!(file.metadata().unwrap().modified().unwrap(), first_mtime);
        // both pushes reach the compile stage; it deduplicates per task
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_non_pet_instances_are_discarded() {
        let (handler, mut rx, store, _dir) = handler().await;
        let mut obj = slice("sop-ct", 0.0);
        obj.put(DataElement::new(
            dicom::dictionary_std::tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
        ));
        assert_eq!(handler.handle_cstore(obj, source()).await, 0x0000);
        assert!(!store.instance_exists("sop-ct").await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_position_is_refused() {
        let (handler, mut rx, store, _dir) = handler().await;
        let mut obj = slice("sop-1", 0.0);
        obj.remove_element(dicom::dictionary_std::tags::IMAGE_POSITION_PATIENT);
        assert_eq!(handler.handle_cstore(obj, source()).await, 0xA700);
        assert!(!store.instance_exists("sop-1").await.unwrap());
        assert!(rx.try_recv().is_err());
    }
}
