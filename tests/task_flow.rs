//! Store-level walk of the task state machine: stage hand-offs, the remote
//! completion callback, operator actions and the boot reconciliation.
use petrelay::{InstanceRecord, Stage, StepState, TaskStore};
use pretty_assertions::assert_eq;

mod util;
use util::pet_instance_record;

async fn seeded_store() -> TaskStore {
    let store = TaskStore::connect("sqlite::memory:").await.unwrap();
    for sop in ["i1", "i2", "i3"] {
        let record: InstanceRecord = pet_instance_record(sop, "series-1", "study-1");
        assert!(store.upsert_instance_tree(&record).await.unwrap());
    }
    store.upsert_source("SCANNER@10.1.1.1").await.unwrap();
    store
        .create_task("202403051200000000", "series-1", "SCANNER@10.1.1.1", Some(3), "i1")
        .await
        .unwrap();
    store.append_task_instance("202403051200000000", "i2").await.unwrap();
    store.append_task_instance("202403051200000000", "i3").await.unwrap();
    store
}

#[tokio::test]
async fn test_task_walks_the_whole_pipeline() {
    let store = seeded_store().await;
    let id = "202403051200000000";

    // compile done
    store.complete_compile(id, "{}").await.unwrap();
    let task = store.task(id).await.unwrap();
    assert_eq!(task.current_step, Stage::Validate);
    assert_eq!(task.step_state, StepState::StepDone);
    assert_eq!(task.imgs, 3);
    assert_eq!(task.expected_imgs, Some(3));

    // the manager dispatches each step-done task exactly once
    let claimed = store.claim_step_done().await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(store.claim_step_done().await.unwrap().is_empty());

    for (next, status) in [
        (Stage::Pack, "validated"),
        (Stage::Upload, "packed"),
    ] {
        store.advance(id, next, status).await.unwrap();
        let claimed = store.claim_step_done().await.unwrap();
        assert_eq!(claimed[0].current_step, next);
    }

    // upload leaves the task parked until the server calls back
    store.set_status(id, "processing").await.unwrap();
    assert!(store.claim_step_done().await.unwrap().is_empty());
    store.set_ready_for_download(id).await.unwrap();
    let claimed = store.claim_step_done().await.unwrap();
    assert_eq!(claimed[0].current_step, Stage::Download);

    store.advance(id, Stage::Unpack, "downloaded").await.unwrap();
    store.claim_step_done().await.unwrap();
    store.advance(id, Stage::Send, "results stored").await.unwrap();
    store.claim_step_done().await.unwrap();
    store.mark_completed(id, "PACS1: 3/3").await.unwrap();

    let task = store.task(id).await.unwrap();
    assert_eq!(task.step_state, StepState::Completed);
    assert_eq!(task.status_msg.as_deref(), Some("PACS1: 3/3"));
}

#[tokio::test]
async fn test_no_task_survives_a_restart_in_processing() {
    let store = seeded_store().await;
    let n = store.abort_processing_tasks("aborted - app reset").await.unwrap();
    assert_eq!(n, 1);
    let task = store.task("202403051200000000").await.unwrap();
    assert_eq!(task.step_state, StepState::Failed);
    assert_eq!(task.status_msg.as_deref(), Some("aborted - app reset"));
    // idempotent: a second boot has nothing left to abort
    assert_eq!(store.abort_processing_tasks("aborted - app reset").await.unwrap(), 0);
}

#[tokio::test]
async fn test_result_series_link_and_cleanup() {
    let store = seeded_store().await;
    let id = "202403051200000000";

    // a result series appears through the same upserts the receive path uses
    let result = pet_instance_record("r1", "result-series", "study-1");
    store.upsert_instance_tree(&result).await.unwrap();
    store.set_series_originating_task("result-series", id).await.unwrap();

    let series = store.result_series(id).await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(store.result_instances(id).await.unwrap().len(), 1);

    // unpack restarts drop earlier results first
    let dirs = store.delete_result_series(id).await.unwrap();
    assert_eq!(dirs.len(), 1);
    assert!(store.result_series(id).await.unwrap().is_empty());
    assert!(!store.instance_exists("r1").await.unwrap());
}

#[tokio::test]
async fn test_delete_task_removes_source_series() {
    let store = seeded_store().await;
    let id = "202403051200000000";
    store.mark_failed(id, "Failed - timed out", "").await.unwrap();
    petrelay::delete_task(&store, id).await.unwrap();
    assert!(store.task(id).await.is_err());
    assert!(store.series_by_uid("series-1").await.unwrap().is_none());
    for sop in ["i1", "i2", "i3"] {
        assert!(!store.instance_exists(sop).await.unwrap());
    }
}

#[tokio::test]
async fn test_operator_retry_preserves_the_failed_stage() {
    let store = seeded_store().await;
    let id = "202403051200000000";
    store.complete_compile(id, "{}").await.unwrap();
    store.claim_step_done().await.unwrap();
    store
        .mark_failed(id, "failed - no destination", "no destination configured")
        .await
        .unwrap();

    petrelay::retry_last_step(&store, id).await.unwrap();
    let task = store.task(id).await.unwrap();
    assert_eq!(task.current_step, Stage::Validate);
    assert_eq!(task.step_state, StepState::StepDone);

    // a failed compile retry starts the task over instead
    store.claim_step_done().await.unwrap();
    petrelay::restart_task(&store, id).await.unwrap_err();
    store.mark_failed(id, "failed", "").await.unwrap();
    petrelay::restart_task(&store, id).await.unwrap();
    let task = store.task(id).await.unwrap();
    assert_eq!(task.current_step, Stage::Compile);
    assert_eq!(task.step_state, StepState::Processing);
}
