//! Inbound HTTP surface: the remote server's completion callback.
use crate::error::TaskStoreError;
use crate::task_store::TaskStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct ProcessReadyRequest {
    task_id: String,
}

pub(crate) fn router(store: TaskStore) -> Router {
    Router::new()
        .route("/process_ready", post(process_ready))
        .with_state(store)
}

/// The remote server signals that processing of a task finished; hand the
/// task to the download stage.
async fn process_ready(
    State(store): State<TaskStore>,
    Json(request): Json<ProcessReadyRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match store.set_ready_for_download(&request.task_id).await {
        Ok(()) => {
            tracing::info!(task_id = request.task_id, "processing done, downloading results");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "message": "Acknowledge" })),
            )
        }
        Err(TaskStoreError::TaskNotFound(task_id)) => {
            tracing::warn!(task_id, "process_ready for an unknown task");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "message": "unknown task_id" })),
            )
        }
        Err(e) => {
            tracing::error!("process_ready could not update the store: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "message": "task store unavailable" })),
            )
        }
    }
}

/// Serve the callback endpoint until cancelled.
pub(crate) async fn serve(
    store: TaskStore,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("http api listening on: http://0.0.0.0:{port}");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    async fn store_with_waiting_task() -> TaskStore {
        let store = TaskStore::connect("sqlite::memory:").await.unwrap();
        let record = crate::task_store::InstanceRecord {
            sop_uid: "i1".to_string(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.128".to_string(),
            filename: "incoming/st1/s1/i1".into(),
            patient_id: "P1".to_string(),
            patient_name: None,
            study_uid: "st1".to_string(),
            study_date: None,
            study_description: None,
            patient_weight: None,
            patient_size: None,
            patient_age: None,
            series_uid: "s1".to_string(),
            series_date: None,
            series_description: None,
            modality: None,
            series_number: None,
            study_dir: "incoming/st1".into(),
            series_dir: "incoming/st1/s1".into(),
        };
        store.upsert_instance_tree(&record).await.unwrap();
        store.upsert_source("A@1.1.1.1").await.unwrap();
        store
            .create_task("t1", "s1", "A@1.1.1.1", None, "i1")
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_process_ready_dispatches_download() {
        let store = store_with_waiting_task().await;
        let app = router(store.clone());
        let response = app
            .oneshot(
                axum::http::Request::post("/process_ready")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"task_id": "t1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task = store.task("t1").await.unwrap();
        assert_eq!(task.current_step, crate::models::Stage::Download);
        assert_eq!(task.step_state, crate::models::StepState::StepDone);
    }

    #[tokio::test]
    async fn test_process_ready_unknown_task() {
        let store = store_with_waiting_task().await;
        let response = router(store)
            .oneshot(
                axum::http::Request::post("/process_ready")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"task_id": "nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
