//! Durable, transactional state for patients, studies, series, instances,
//! devices and tasks.
//!
//! Every mutation runs inside a transaction; stage loops call these methods
//! and retry on [TaskStoreError] so a task is never stranded mid-step. Task
//! `updated` is refreshed on every mutation.
use crate::error::TaskStoreError;
use crate::models::{
    AppConfig, Device, FilterMode, FilterSettings, Instance, Radiopharmaceutical, Series, Stage,
    StepState, Study, Task,
};
use crate::schema;
use camino::Utf8PathBuf;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use time::OffsetDateTime;

/// Columns of a task row, with the live instance count attached.
const TASK_COLUMNS: &str = "id, started, updated, current_step, recon_settings, step_state, \
     status_msg, full_status_msg, expected_imgs, visible, series, source, radiopharmaceutical, \
     (SELECT COUNT(*) FROM task_instance ti WHERE ti.task_id = task.id) AS imgs";

impl<'r> sqlx::FromRow<'r, SqliteRow> for Task {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let step: String = row.try_get("current_step")?;
        let state: i64 = row.try_get("step_state")?;
        Ok(Task {
            id: row.try_get("id")?,
            started: row.try_get("started")?,
            updated: row.try_get("updated")?,
            current_step: step.parse().map_err(|e| sqlx::Error::ColumnDecode {
                index: "current_step".to_string(),
                source: Box::new(e),
            })?,
            recon_settings: row.try_get("recon_settings")?,
            step_state: StepState::from_i64(state).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "step_state".to_string(),
                source: format!("step_state out of range: {state}").into(),
            })?,
            status_msg: row.try_get("status_msg")?,
            full_status_msg: row.try_get("full_status_msg")?,
            imgs: row.try_get("imgs")?,
            expected_imgs: row.try_get("expected_imgs")?,
            visible: row.try_get("visible")?,
            series: row.try_get("series")?,
            source: row.try_get("source")?,
            radiopharmaceutical: row.try_get("radiopharmaceutical")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for FilterSettings {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let mode: String = row.try_get("mode")?;
        Ok(FilterSettings {
            id: row.try_get("id")?,
            fwhm: row.try_get("fwhm")?,
            description: row.try_get("description")?,
            mode: FilterMode::parse(&mode),
            series_number: row.try_get("series_number")?,
            noise: row.try_get("noise")?,
            model: row.try_get("model")?,
            radiopharmaceutical: row.try_get("radiopharmaceutical")?,
            enabled: row.try_get("enabled")?,
        })
    }
}

/// Metadata of one received instance, ready for the entity upserts.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub sop_uid: String,
    pub sop_class_uid: String,
    pub filename: Utf8PathBuf,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_uid: String,
    pub study_date: Option<OffsetDateTime>,
    pub study_description: Option<String>,
    pub patient_weight: Option<f64>,
    pub patient_size: Option<f64>,
    pub patient_age: Option<String>,
    pub series_uid: String,
    pub series_date: Option<OffsetDateTime>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    pub series_number: Option<i64>,
    pub study_dir: Utf8PathBuf,
    pub series_dir: Utf8PathBuf,
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (creating if missing) the store and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, TaskStoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await?;
        for statement in schema::DDL {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- boot -----------------------------------------------------------

    /// Insert the AppConfig singleton from defaults unless a row exists.
    pub async fn ensure_app_config(&self, defaults: &AppConfig) -> Result<AppConfig, TaskStoreError> {
        if let Some(existing) =
            sqlx::query_as::<_, AppConfig>("SELECT * FROM app_config LIMIT 1")
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(existing);
        }
        sqlx::query(
            "INSERT OR IGNORE INTO app_config (client_id, min_instances_in_series, \
             slice_gap_tolerance, series_timeout, store_scp_port, store_scp_aet, ip_address, \
             mirror_mode, server_url, shared_mount_point, zip_dir, unzip_dir, download_path) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&defaults.client_id)
        .bind(defaults.min_instances_in_series)
        .bind(defaults.slice_gap_tolerance)
        .bind(defaults.series_timeout)
        .bind(defaults.store_scp_port)
        .bind(&defaults.store_scp_aet)
        .bind(&defaults.ip_address)
        .bind(defaults.mirror_mode)
        .bind(&defaults.server_url)
        .bind(&defaults.shared_mount_point)
        .bind(&defaults.zip_dir)
        .bind(&defaults.unzip_dir)
        .bind(&defaults.download_path)
        .execute(&self.pool)
        .await?;
        self.app_config().await
    }

    pub async fn app_config(&self) -> Result<AppConfig, TaskStoreError> {
        sqlx::query_as::<_, AppConfig>("SELECT * FROM app_config LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TaskStoreError::MissingAppConfig)
    }

    /// Force every task still marked as processing into the failed state.
    /// Called once on boot, before any stage starts.
    pub async fn abort_processing_tasks(&self, message: &str) -> Result<u64, TaskStoreError> {
        let result = sqlx::query(
            "UPDATE task SET step_state = -1, status_msg = ?, updated = ? WHERE step_state = 0",
        )
        .bind(message)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- entity upserts -------------------------------------------------

    /// Upsert the patient/study/series rows of a received instance and
    /// insert the instance itself. Returns `false` when the instance row
    /// already existed (duplicate push).
    pub async fn upsert_instance_tree(&self, rec: &InstanceRecord) -> Result<bool, TaskStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO patient (patient_id, patient_name) VALUES (?, ?) \
             ON CONFLICT(patient_id) DO UPDATE SET \
             patient_name = COALESCE(excluded.patient_name, patient.patient_name)",
        )
        .bind(&rec.patient_id)
        .bind(&rec.patient_name)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO study (study_uid, study_date, study_description, patient_id, \
             patient_weight, patient_size, patient_age, stored_in) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(study_uid) DO UPDATE SET \
             study_date = COALESCE(excluded.study_date, study.study_date), \
             study_description = COALESCE(excluded.study_description, study.study_description), \
             patient_weight = COALESCE(excluded.patient_weight, study.patient_weight), \
             patient_size = COALESCE(excluded.patient_size, study.patient_size), \
             patient_age = COALESCE(excluded.patient_age, study.patient_age)",
        )
        .bind(&rec.study_uid)
        .bind(rec.study_date)
        .bind(&rec.study_description)
        .bind(&rec.patient_id)
        .bind(rec.patient_weight)
        .bind(rec.patient_size)
        .bind(&rec.patient_age)
        .bind(rec.study_dir.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO series (series_uid, series_date, series_description, modality, \
             series_number, patient_id, study_uid, stored_in) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(series_uid) DO UPDATE SET \
             series_date = COALESCE(series.series_date, excluded.series_date), \
             series_description = COALESCE(excluded.series_description, series.series_description), \
             modality = COALESCE(excluded.modality, series.modality), \
             series_number = COALESCE(excluded.series_number, series.series_number)",
        )
        .bind(&rec.series_uid)
        .bind(rec.series_date)
        .bind(&rec.series_description)
        .bind(&rec.modality)
        .bind(rec.series_number)
        .bind(&rec.patient_id)
        .bind(&rec.study_uid)
        .bind(rec.series_dir.as_str())
        .execute(&mut *tx)
        .await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO instance (sop_uid, sop_class_uid, filename, patient_id, \
             study_uid, series_uid) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&rec.sop_uid)
        .bind(&rec.sop_class_uid)
        .bind(rec.filename.as_str())
        .bind(&rec.patient_id)
        .bind(&rec.study_uid)
        .bind(&rec.series_uid)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(inserted > 0)
    }

    pub async fn instance_exists(&self, sop_uid: &str) -> Result<bool, TaskStoreError> {
        let row = sqlx::query("SELECT 1 FROM instance WHERE sop_uid = ?")
            .bind(sop_uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn upsert_source(&self, identifier: &str) -> Result<(), TaskStoreError> {
        sqlx::query("INSERT OR IGNORE INTO source (identifier) VALUES (?)")
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- task lifecycle -------------------------------------------------

    /// Task in (compile, processing) for the series/source pair which does
    /// not already contain the given instance.
    pub async fn compile_candidate(
        &self,
        series_uid: &str,
        source: &str,
        sop_uid: &str,
    ) -> Result<Option<Task>, TaskStoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE current_step = 'compile' AND step_state = 0 \
             AND series = ? AND source = ? \
             AND NOT EXISTS (SELECT 1 FROM task_instance ti \
                             WHERE ti.task_id = task.id AND ti.sop_uid = ?) \
             ORDER BY id LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(series_uid)
            .bind(source)
            .bind(sop_uid)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Create a new compile task holding its first instance.
    pub async fn create_task(
        &self,
        id: &str,
        series_uid: &str,
        source: &str,
        expected_imgs: Option<i64>,
        first_sop_uid: &str,
    ) -> Result<(), TaskStoreError> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO task (id, started, updated, current_step, step_state, status_msg, \
             expected_imgs, visible, series, source) VALUES (?, ?, ?, 'compile', 0, 'receiving', ?, 1, ?, ?)",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(expected_imgs)
        .bind(series_uid)
        .bind(source)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO task_instance (task_id, sop_uid) VALUES (?, ?)")
            .bind(id)
            .bind(first_sop_uid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn append_task_instance(
        &self,
        task_id: &str,
        sop_uid: &str,
    ) -> Result<(), TaskStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO task_instance (task_id, sop_uid) VALUES (?, ?)")
            .bind(task_id)
            .bind(sop_uid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE task SET updated = ? WHERE id = ?")
            .bind(OffsetDateTime::now_utc())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn task(&self, id: &str) -> Result<Task, TaskStoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task WHERE id = ?");
        sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TaskStoreError::TaskNotFound(id.to_string()))
    }

    pub async fn tasks_in(&self, stage: Stage, state: StepState) -> Result<Vec<Task>, TaskStoreError> {
        let sql =
            format!("SELECT {TASK_COLUMNS} FROM task WHERE current_step = ? AND step_state = ? ORDER BY id");
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(stage.as_str())
            .bind(state.as_i64())
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn tasks_with_status(&self, status_msg: &str) -> Result<Vec<Task>, TaskStoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task WHERE status_msg = ? ORDER BY id");
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(status_msg)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn set_status(&self, task_id: &str, status_msg: &str) -> Result<(), TaskStoreError> {
        sqlx::query("UPDATE task SET status_msg = ?, updated = ? WHERE id = ?")
            .bind(status_msg)
            .bind(OffsetDateTime::now_utc())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_recon_settings(
        &self,
        task_id: &str,
        recon_json: &str,
    ) -> Result<(), TaskStoreError> {
        sqlx::query("UPDATE task SET recon_settings = ?, updated = ? WHERE id = ?")
            .bind(recon_json)
            .bind(OffsetDateTime::now_utc())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark the current step finished and hand the task to `next`. The task
    /// manager will move it into that stage's queue.
    pub async fn advance(
        &self,
        task_id: &str,
        next: Stage,
        status_msg: &str,
    ) -> Result<(), TaskStoreError> {
        sqlx::query(
            "UPDATE task SET current_step = ?, step_state = 1, status_msg = ?, updated = ? WHERE id = ?",
        )
        .bind(next.as_str())
        .bind(status_msg)
        .bind(OffsetDateTime::now_utc())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the canonical recon settings and hand the task to validate, in
    /// one transaction.
    pub async fn complete_compile(
        &self,
        task_id: &str,
        recon_json: &str,
    ) -> Result<(), TaskStoreError> {
        sqlx::query(
            "UPDATE task SET recon_settings = ?, current_step = 'validate', step_state = 1, \
             status_msg = 'compiled', updated = ? WHERE id = ?",
        )
        .bind(recon_json)
        .bind(OffsetDateTime::now_utc())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        task_id: &str,
        status_msg: &str,
        full_status_msg: &str,
    ) -> Result<(), TaskStoreError> {
        sqlx::query(
            "UPDATE task SET step_state = -1, status_msg = ?, full_status_msg = ?, updated = ? WHERE id = ?",
        )
        .bind(status_msg)
        .bind(full_status_msg)
        .bind(OffsetDateTime::now_utc())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, task_id: &str, status_msg: &str) -> Result<(), TaskStoreError> {
        sqlx::query("UPDATE task SET step_state = 2, status_msg = ?, updated = ? WHERE id = ?")
            .bind(status_msg)
            .bind(OffsetDateTime::now_utc())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip every step-done task back to processing and return them, so the
    /// caller can enqueue each into its stage exactly once.
    pub async fn claim_step_done(&self) -> Result<Vec<Task>, TaskStoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM task WHERE step_state = 1 ORDER BY id");
        let tasks = sqlx::query_as::<_, Task>(&sql).fetch_all(&mut *tx).await?;
        let now = OffsetDateTime::now_utc();
        for task in &tasks {
            sqlx::query("UPDATE task SET step_state = 0, updated = ? WHERE id = ?")
                .bind(now)
                .bind(&task.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(tasks)
    }

    /// The remote server finished a task: have the download stage pick it up.
    pub async fn set_ready_for_download(&self, task_id: &str) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            "UPDATE task SET current_step = 'download', step_state = 1, updated = ? WHERE id = ?",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TaskStoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    // ---- task relations -------------------------------------------------

    pub async fn task_instances(&self, task_id: &str) -> Result<Vec<Instance>, TaskStoreError> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT i.* FROM instance i JOIN task_instance ti ON ti.sop_uid = i.sop_uid \
             WHERE ti.task_id = ? ORDER BY i.sop_uid",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn add_task_destinations(
        &self,
        task_id: &str,
        device_names: &[String],
    ) -> Result<(), TaskStoreError> {
        let mut tx = self.pool.begin().await?;
        for name in device_names {
            sqlx::query("INSERT OR IGNORE INTO task_destination (task_id, device_name) VALUES (?, ?)")
                .bind(task_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn task_destinations(&self, task_id: &str) -> Result<Vec<Device>, TaskStoreError> {
        Ok(sqlx::query_as::<_, Device>(
            "SELECT d.* FROM device d JOIN task_destination td ON td.device_name = d.name \
             WHERE td.task_id = ? ORDER BY d.name",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn set_task_radiopharmaceutical(
        &self,
        task_id: &str,
        name: &str,
    ) -> Result<(), TaskStoreError> {
        sqlx::query("UPDATE task SET radiopharmaceutical = ?, updated = ? WHERE id = ?")
            .bind(name)
            .bind(OffsetDateTime::now_utc())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Result series of a task, newest first.
    pub async fn result_series(&self, task_id: &str) -> Result<Vec<Series>, TaskStoreError> {
        Ok(sqlx::query_as::<_, Series>(
            "SELECT * FROM series WHERE originating_task = ? ORDER BY series_uid",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn result_instances(&self, task_id: &str) -> Result<Vec<Instance>, TaskStoreError> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT i.* FROM instance i JOIN series s ON s.series_uid = i.series_uid \
             WHERE s.originating_task = ? ORDER BY i.sop_uid",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn set_series_originating_task(
        &self,
        series_uid: &str,
        task_id: &str,
    ) -> Result<(), TaskStoreError> {
        sqlx::query("UPDATE series SET originating_task = ? WHERE series_uid = ?")
            .bind(task_id)
            .bind(series_uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the result series of a task (rows only). Returns the storage
    /// directories of the deleted series for filesystem reconciliation.
    pub async fn delete_result_series(&self, task_id: &str) -> Result<Vec<String>, TaskStoreError> {
        let mut tx = self.pool.begin().await?;
        let series: Vec<Series> =
            sqlx::query_as("SELECT * FROM series WHERE originating_task = ?")
                .bind(task_id)
                .fetch_all(&mut *tx)
                .await?;
        let mut dirs = Vec::with_capacity(series.len());
        for s in &series {
            sqlx::query(
                "DELETE FROM task_instance WHERE sop_uid IN \
                 (SELECT sop_uid FROM instance WHERE series_uid = ?)",
            )
            .bind(&s.series_uid)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM instance WHERE series_uid = ?")
                .bind(&s.series_uid)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM series WHERE series_uid = ?")
                .bind(&s.series_uid)
                .execute(&mut *tx)
                .await?;
            if let Some(dir) = &s.stored_in {
                dirs.push(dir.clone());
            }
        }
        tx.commit().await?;
        Ok(dirs)
    }

    // ---- lookup tables --------------------------------------------------

    pub async fn destination_devices(&self) -> Result<Vec<Device>, TaskStoreError> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM device WHERE is_destination = 1 ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn devices_by_address(&self, address: &str) -> Result<Vec<Device>, TaskStoreError> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM device WHERE address = ? ORDER BY name")
                .bind(address)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn devices_by_address_and_aet(
        &self,
        address: &str,
        ae_title: &str,
    ) -> Result<Vec<Device>, TaskStoreError> {
        Ok(sqlx::query_as::<_, Device>(
            "SELECT * FROM device WHERE address = ? AND ae_title = ? ORDER BY name",
        )
        .bind(address)
        .bind(ae_title)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn add_device(&self, device: &Device) -> Result<(), TaskStoreError> {
        sqlx::query(
            "INSERT INTO device (name, ae_title, address, port, is_destination) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET ae_title = excluded.ae_title, \
             address = excluded.address, port = excluded.port, is_destination = excluded.is_destination",
        )
        .bind(&device.name)
        .bind(&device.ae_title)
        .bind(&device.address)
        .bind(device.port)
        .bind(device.is_destination)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn radiopharmaceuticals(&self) -> Result<Vec<Radiopharmaceutical>, TaskStoreError> {
        Ok(
            sqlx::query_as::<_, Radiopharmaceutical>("SELECT * FROM radiopharmaceutical ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn radiopharmaceutical(
        &self,
        name: &str,
    ) -> Result<Option<Radiopharmaceutical>, TaskStoreError> {
        Ok(
            sqlx::query_as::<_, Radiopharmaceutical>("SELECT * FROM radiopharmaceutical WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn add_radiopharmaceutical(
        &self,
        rf: &Radiopharmaceutical,
    ) -> Result<(), TaskStoreError> {
        sqlx::query(
            "INSERT INTO radiopharmaceutical (name, synonyms, half_life) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET synonyms = excluded.synonyms, half_life = excluded.half_life",
        )
        .bind(&rf.name)
        .bind(&rf.synonyms)
        .bind(rf.half_life)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn register_pet_model(&self, name: &str) -> Result<(), TaskStoreError> {
        sqlx::query("INSERT OR IGNORE INTO pet_model (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn filter_settings(&self) -> Result<Vec<FilterSettings>, TaskStoreError> {
        Ok(
            sqlx::query_as::<_, FilterSettings>("SELECT * FROM filter_settings ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn add_filter_settings(&self, f: &FilterSettings) -> Result<(), TaskStoreError> {
        sqlx::query(
            "INSERT INTO filter_settings (fwhm, description, mode, series_number, noise, model, \
             radiopharmaceutical, enabled) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(f.fwhm)
        .bind(&f.description)
        .bind(f.mode.as_str())
        .bind(f.series_number)
        .bind(f.noise)
        .bind(&f.model)
        .bind(&f.radiopharmaceutical)
        .bind(f.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- lookups used by pack/upload ------------------------------------

    pub async fn series_by_uid(&self, series_uid: &str) -> Result<Option<Series>, TaskStoreError> {
        Ok(
            sqlx::query_as::<_, Series>("SELECT * FROM series WHERE series_uid = ?")
                .bind(series_uid)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn study_by_uid(&self, study_uid: &str) -> Result<Option<Study>, TaskStoreError> {
        Ok(sqlx::query_as::<_, Study>("SELECT * FROM study WHERE study_uid = ?")
            .bind(study_uid)
            .fetch_optional(&self.pool)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn memory_store() -> TaskStore {
        TaskStore::connect("sqlite::memory:").await.unwrap()
    }

    fn record(sop: &str, series: &str) -> InstanceRecord {
        InstanceRecord {
            sop_uid: sop.to_string(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.128".to_string(),
            filename: Utf8PathBuf::from(format!("incoming/st1/{series}/{sop}")),
            patient_id: "P1".to_string(),
            patient_name: Some("DOE^JANE".to_string()),
            study_uid: "st1".to_string(),
            study_date: None,
            study_description: Some("PET WB".to_string()),
            patient_weight: Some(70.0),
            patient_size: Some(1.7),
            patient_age: Some("065Y".to_string()),
            series_uid: series.to_string(),
            series_date: None,
            series_description: Some("AC PET".to_string()),
            modality: Some("PT".to_string()),
            series_number: Some(3),
            study_dir: Utf8PathBuf::from("incoming/st1"),
            series_dir: Utf8PathBuf::from(format!("incoming/st1/{series}")),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = memory_store().await;
        assert!(store.upsert_instance_tree(&record("i1", "s1")).await.unwrap());
        assert!(!store.upsert_instance_tree(&record("i1", "s1")).await.unwrap());
        assert!(store.instance_exists("i1").await.unwrap());
        assert!(!store.instance_exists("i2").await.unwrap());
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = memory_store().await;
        store.upsert_instance_tree(&record("i1", "s1")).await.unwrap();
        store.upsert_source("AET1@10.1.1.1").await.unwrap();
        store
            .create_task("202401010000000000", "s1", "AET1@10.1.1.1", Some(3), "i1")
            .await
            .unwrap();

        let found = store
            .compile_candidate("s1", "AET1@10.1.1.1", "i2")
            .await
            .unwrap()
            .expect("candidate for an unseen instance");
        assert_eq!(found.id, "202401010000000000");
        assert_eq!(found.imgs, 1);
        // the task already holds i1, so it is no candidate for i1
        assert!(store
            .compile_candidate("s1", "AET1@10.1.1.1", "i1")
            .await
            .unwrap()
            .is_none());

        store.upsert_instance_tree(&record("i2", "s1")).await.unwrap();
        store.append_task_instance(&found.id, "i2").await.unwrap();
        assert_eq!(store.task(&found.id).await.unwrap().imgs, 2);

        store.advance(&found.id, Stage::Validate, "compiled").await.unwrap();
        let claimed = store.claim_step_done().await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].current_step, Stage::Validate);
        assert!(store.claim_step_done().await.unwrap().is_empty());
        assert_eq!(
            store.task(&found.id).await.unwrap().step_state,
            StepState::Processing
        );
    }

    #[tokio::test]
    async fn test_abort_processing_tasks_on_boot() {
        let store = memory_store().await;
        store.upsert_instance_tree(&record("i1", "s1")).await.unwrap();
        store.upsert_source("A@1.1.1.1").await.unwrap();
        store.create_task("t1", "s1", "A@1.1.1.1", None, "i1").await.unwrap();
        let n = store.abort_processing_tasks("aborted - app reset").await.unwrap();
        assert_eq!(n, 1);
        let task = store.task("t1").await.unwrap();
        assert_eq!(task.step_state, StepState::Failed);
        assert_eq!(task.status_msg.as_deref(), Some("aborted - app reset"));
    }

    #[tokio::test]
    async fn test_app_config_singleton() {
        let store = memory_store().await;
        let defaults = AppConfig {
            client_id: "clinic-a".to_string(),
            min_instances_in_series: 47,
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
        };
        let config = store.ensure_app_config(&defaults).await.unwrap();
        assert_eq!(config.client_id, "clinic-a");
        // second boot keeps the existing row
        let mut changed = defaults.clone();
        changed.client_id = "other".to_string();
        let config = store.ensure_app_config(&changed).await.unwrap();
        assert_eq!(config.client_id, "clinic-a");
    }
}
