//! Operator task actions and garbage collection.
//!
//! Deletion cascades are explicit: rows go inside one transaction, files are
//! reconciled afterwards, best-effort. Inability to remove a file never
//! blocks the row deletion.
use crate::error::TaskStoreError;
use crate::models::{Series, StepState};
use crate::task_store::TaskStore;
use camino::{Utf8Path, Utf8PathBuf};
use sqlx::Row;
use time::OffsetDateTime;

#[derive(thiserror::Error, Debug)]
pub enum ActionError {
    #[error("task {0} doesn't exist")]
    NotFound(String),

    #[error("only completed or failed tasks can be {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

/// Delete a terminal task with its cascade: result series always, the
/// source series only when no other task references it.
pub async fn delete_task(store: &TaskStore, task_id: &str) -> Result<(), ActionError> {
    let task = store
        .task(task_id)
        .await
        .map_err(|_| ActionError::NotFound(task_id.to_string()))?;
    if !task.step_state.is_terminal() {
        return Err(ActionError::InvalidState("deleted"));
    }
    tracing::info!(task_id, "deleting task");

    let mut tx = store.pool().begin().await.map_err(TaskStoreError::from)?;
    let mut doomed_dirs: Vec<String> = Vec::new();

    sqlx::query("DELETE FROM task_instance WHERE task_id = ?")
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(TaskStoreError::from)?;
    sqlx::query("DELETE FROM task_destination WHERE task_id = ?")
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(TaskStoreError::from)?;
    sqlx::query("DELETE FROM task WHERE id = ?")
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(TaskStoreError::from)?;

    // result series of this task
    let result_series: Vec<Series> =
        sqlx::query_as("SELECT * FROM series WHERE originating_task = ?")
            .bind(task_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(TaskStoreError::from)?;
    for series in result_series {
        delete_series_rows(&mut tx, &series.series_uid).await?;
        doomed_dirs.extend(series.stored_in);
    }

    // the source series, unless another task still points at it
    if let Some(series_uid) = &task.series {
        let others: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task WHERE series = ?")
            .bind(series_uid)
            .fetch_one(&mut *tx)
            .await
            .map_err(TaskStoreError::from)?;
        if others == 0 {
            let series: Option<Series> = sqlx::query_as("SELECT * FROM series WHERE series_uid = ?")
                .bind(series_uid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(TaskStoreError::from)?;
            if let Some(series) = series {
                tracing::info!(task_id, series_uid, "deleting source series");
                delete_series_rows(&mut tx, &series.series_uid).await?;
                doomed_dirs.extend(series.stored_in);
            }
        } else {
            tracing::info!(task_id, series_uid, "source series kept, other tasks reference it");
        }
    }
    tx.commit().await.map_err(TaskStoreError::from)?;

    remove_dirs(&doomed_dirs).await;
    Ok(())
}

/// Reset a terminal task back to the beginning of the pipeline.
pub async fn restart_task(store: &TaskStore, task_id: &str) -> Result<(), ActionError> {
    let task = store
        .task(task_id)
        .await
        .map_err(|_| ActionError::NotFound(task_id.to_string()))?;
    if !task.step_state.is_terminal() {
        return Err(ActionError::InvalidState("restarted"));
    }
    tracing::info!(task_id, "restarting task");
    sqlx::query(
        "UPDATE task SET current_step = 'compile', step_state = 0, status_msg = 'restarting', \
         updated = ? WHERE id = ?",
    )
    .bind(OffsetDateTime::now_utc())
    .bind(task_id)
    .execute(store.pool())
    .await
    .map_err(TaskStoreError::from)?;
    Ok(())
}

/// Re-enqueue the step a terminal task stopped at. A task sitting at
/// compile is restarted instead.
pub async fn retry_last_step(store: &TaskStore, task_id: &str) -> Result<(), ActionError> {
    let task = store
        .task(task_id)
        .await
        .map_err(|_| ActionError::NotFound(task_id.to_string()))?;
    if !task.step_state.is_terminal() {
        return Err(ActionError::InvalidState("retried"));
    }
    if task.current_step == crate::models::Stage::Compile {
        return restart_task(store, task_id).await;
    }
    tracing::info!(task_id, step = %task.current_step, "retrying last step");
    sqlx::query("UPDATE task SET step_state = 1, status_msg = 'retrying', updated = ? WHERE id = ?")
        .bind(OffsetDateTime::now_utc())
        .bind(task_id)
        .execute(store.pool())
        .await
        .map_err(TaskStoreError::from)?;
    Ok(())
}

/// Hide and delete every completed task in the background, then collect
/// garbage.
pub async fn delete_finished(
    store: &TaskStore,
    incoming_root: &Utf8Path,
) -> Result<usize, ActionError> {
    delete_terminal(store, incoming_root, StepState::Completed).await
}

/// Hide and delete every failed task in the background, then collect
/// garbage.
pub async fn delete_failed(
    store: &TaskStore,
    incoming_root: &Utf8Path,
) -> Result<usize, ActionError> {
    delete_terminal(store, incoming_root, StepState::Failed).await
}

async fn delete_terminal(
    store: &TaskStore,
    incoming_root: &Utf8Path,
    state: StepState,
) -> Result<usize, ActionError> {
    let rows = sqlx::query("SELECT id FROM task WHERE step_state = ?")
        .bind(state.as_i64())
        .fetch_all(store.pool())
        .await
        .map_err(TaskStoreError::from)?;
    let ids: Vec<String> = rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("id").ok())
        .collect();
    tracing::info!(count = ids.len(), "deleting tasks in the background");
    // hide them up front so the UI does not show half-deleted tasks
    for id in &ids {
        if let Err(e) = sqlx::query("UPDATE task SET visible = 0, updated = ? WHERE id = ?")
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(store.pool())
            .await
        {
            tracing::error!(task_id = id, "could not hide task: {e}");
        }
    }
    let count = ids.len();
    let store = store.clone();
    let incoming_root = incoming_root.to_owned();
    tokio::spawn(async move {
        for id in ids {
            if let Err(e) = delete_task(&store, &id).await {
                tracing::error!(task_id = id, "background deletion failed: {e}");
                if let Err(e) = sqlx::query("UPDATE task SET visible = 1 WHERE id = ?")
                    .bind(&id)
                    .execute(store.pool())
                    .await
                {
                    tracing::error!(task_id = id, "task can't be made visible again: {e}");
                }
            }
        }
        if let Err(e) = clear_database(&store, &incoming_root).await {
            tracing::error!("garbage collection failed: {e}");
        }
    });
    Ok(count)
}

/// Remove rows nothing references anymore: series without tasks, orphan
/// instances, empty studies, patients without series. Finishes with a
/// storage sweep.
pub async fn clear_database(
    store: &TaskStore,
    incoming_root: &Utf8Path,
) -> Result<(), TaskStoreError> {
    let mut doomed_dirs: Vec<String> = Vec::new();
    let mut tx = store.pool().begin().await?;

    let unreferenced: Vec<Series> = sqlx::query_as(
        "SELECT * FROM series WHERE originating_task IS NULL \
         AND series_uid NOT IN (SELECT series FROM task WHERE series IS NOT NULL)",
    )
    .fetch_all(&mut *tx)
    .await?;
    for series in unreferenced {
        tracing::info!(series_uid = series.series_uid, "deleting unreferenced series");
        delete_series_rows(&mut tx, &series.series_uid).await?;
        doomed_dirs.extend(series.stored_in);
    }

    sqlx::query(
        "DELETE FROM task_instance WHERE sop_uid IN (SELECT sop_uid FROM instance \
         WHERE series_uid IS NULL OR series_uid NOT IN (SELECT series_uid FROM series))",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM instance WHERE series_uid IS NULL \
         OR series_uid NOT IN (SELECT series_uid FROM series)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "DELETE FROM study WHERE study_uid NOT IN \
         (SELECT study_uid FROM series WHERE study_uid IS NOT NULL)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM patient WHERE patient_id NOT IN \
         (SELECT patient_id FROM series WHERE patient_id IS NOT NULL)",
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    remove_dirs(&doomed_dirs).await;
    clear_storage(store, incoming_root).await
}

/// Walk `incoming/` and remove study/series directories no row points at.
pub async fn clear_storage(
    store: &TaskStore,
    incoming_root: &Utf8Path,
) -> Result<(), TaskStoreError> {
    let study_dirs = match list_dirs(incoming_root) {
        Ok(dirs) => dirs,
        Err(e) => {
            tracing::error!("cannot walk {incoming_root}: {e}");
            return Ok(());
        }
    };
    for study_dir in study_dirs {
        let known = sqlx::query("SELECT 1 FROM study WHERE stored_in = ?")
            .bind(study_dir.as_str())
            .fetch_optional(store.pool())
            .await?
            .is_some();
        if !known {
            tracing::info!(dir = study_dir.as_str(), "deleting unreferenced study storage");
            remove_dirs(&[study_dir.to_string()]).await;
            continue;
        }
        for series_dir in list_dirs(&study_dir).unwrap_or_default() {
            let known = sqlx::query("SELECT 1 FROM series WHERE stored_in = ?")
                .bind(series_dir.as_str())
                .fetch_optional(store.pool())
                .await?
                .is_some();
            if !known {
                tracing::info!(dir = series_dir.as_str(), "deleting unreferenced series storage");
                remove_dirs(&[series_dir.to_string()]).await;
            }
        }
    }
    Ok(())
}

async fn delete_series_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    series_uid: &str,
) -> Result<(), TaskStoreError> {
    sqlx::query(
        "DELETE FROM task_instance WHERE sop_uid IN \
         (SELECT sop_uid FROM instance WHERE series_uid = ?)",
    )
    .bind(series_uid)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM instance WHERE series_uid = ?")
        .bind(series_uid)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM series WHERE series_uid = ?")
        .bind(series_uid)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn remove_dirs(dirs: &[String]) {
    for dir in dirs {
        match fs_err::tokio::remove_dir_all(dir).await {
            Ok(()) => tracing::info!(dir, "deleted storage directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(dir, "couldn't delete storage directory: {e}"),
        }
    }
}

fn list_dirs(root: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs_err::read_dir(root.as_std_path())? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
                dirs.push(path);
            }
        }
    }
    Ok(dirs)
}
