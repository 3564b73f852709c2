//! Send stage: C-STORE the rebuilt series to every destination device.
use crate::error::TaskStoreError;
use crate::scu;
use crate::stage::StageContext;
use camino::Utf8PathBuf;

pub(crate) async fn handle_task(ctx: &StageContext, task_id: &str) -> Result<(), TaskStoreError> {
    let paths: Vec<Utf8PathBuf> = ctx
        .store
        .result_instances(task_id)
        .await?
        .into_iter()
        .map(|i| Utf8PathBuf::from(i.filename))
        .collect();
    let destinations = ctx.store.task_destinations(task_id).await?;
    ctx.store.set_status(task_id, "sending results").await?;

    let total = paths.len();
    let mut counts = Vec::with_capacity(destinations.len());
    let mut any_delivered = false;
    for device in destinations {
        let calling_aet = ctx.our_aet.to_string();
        let device_name = device.name.clone();
        let batch = paths.clone();
        let result =
            tokio::task::spawn_blocking(move || scu::send_files(&calling_aet, &device, &batch))
                .await;
        let delivered = match result {
            Ok(Ok(flags)) => flags.into_iter().filter(|ok| *ok).count(),
            Ok(Err(e)) => {
                tracing::error!(task_id, device = device_name, "send failed: {e}");
                0
            }
            Err(e) => {
                tracing::error!(task_id, device = device_name, "send task died: {e}");
                0
            }
        };
        any_delivered |= delivered > 0;
        counts.push(format!("{device_name}: {delivered}/{total}"));
    }

    let summary = counts.join("; ");
    tracing::info!(task_id, summary, "send stage finished");
    if any_delivered || total == 0 {
        // Per-destination counts are reported to the operator even when
        // some destinations missed instances.
        ctx.store.mark_completed(task_id, &summary).await?;
    } else {
        ctx.store
            .mark_failed(
                task_id,
                "failed - send",
                &format!(
                    "No result instance could be delivered to any destination ({summary}). \
                     Check the destination device configuration and connectivity, then retry \
                     this step."
                ),
            )
            .await?;
    }
    Ok(())
}
