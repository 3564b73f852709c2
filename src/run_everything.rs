//! Wires the store, channels and stage loops together and runs them all.
use crate::compile::compile_stage_loop;
use crate::config::get_config;
use crate::dicom_settings::{DicomListenerSettings, OurAETitle};
use crate::listener_tcp_loop::DicomListener;
use crate::models::AppConfig;
use crate::remote::RemoteClient;
use crate::scp::StoreDispatcher;
use crate::server_monitor::ServerMonitor;
use crate::settings::EnvOptions;
use crate::stage::{task_stage_loop, StageContext};
use crate::store_handler::StoreHandler;
use crate::task_manager::{task_manager_loop, StageSenders};
use crate::task_store::TaskStore;
use crate::{download, http_api, pack, send, unpack, upload, validate};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Calls [run_everything] using configuration from environment variables.
///
/// `finite_connections`: shut the DICOM listener down after the given
/// number of associations.
pub async fn run_everything_from_env(finite_connections: Option<usize>) -> anyhow::Result<()> {
    let settings = get_config().extract()?;
    run_everything(settings, finite_connections).await
}

/// Runs everything in parallel:
///
/// 1. The DICOM listener accepting C-STORE / C-ECHO
/// 2. The pipeline stages (compile → validate → pack → upload → download →
///    unpack → send), each draining its own queue
/// 3. The task manager moving step-done tasks into the next stage
/// 4. The HTTP callback endpoint and the server monitor
pub async fn run_everything(
    settings: EnvOptions,
    finite_connections: Option<usize>,
) -> anyhow::Result<()> {
    let store = TaskStore::connect(&settings.database_url).await?;
    let config = store.ensure_app_config(&app_config_defaults(&settings)).await?;

    // boot reconciliation
    let aborted = store.abort_processing_tasks("aborted - app reset").await?;
    if aborted > 0 {
        tracing::warn!(aborted, "tasks were left processing by an earlier run");
    }
    for dir in [&config.zip_dir, &config.unzip_dir, &config.download_path] {
        fs_err::tokio::create_dir_all(dir).await?;
    }
    fs_err::tokio::create_dir_all(settings.incoming_root.as_std_path()).await?;

    let cancel = CancellationToken::new();
    let remote = RemoteClient::new();
    let ctx = StageContext {
        store: store.clone(),
        remote: remote.clone(),
        server_interaction: settings.server_interaction,
        incoming_root: settings.incoming_root.clone(),
        http_port: settings.http_port,
        our_aet: OurAETitle::from(config.store_scp_aet.clone()),
    };

    let (compile_tx, compile_rx) = mpsc::unbounded_channel();
    let (validate_tx, validate_rx) = mpsc::unbounded_channel();
    let (pack_tx, pack_rx) = mpsc::unbounded_channel();
    let (upload_tx, upload_rx) = mpsc::unbounded_channel();
    let (download_tx, download_rx) = mpsc::unbounded_channel();
    let (unpack_tx, unpack_rx) = mpsc::unbounded_channel();
    let (send_tx, send_rx) = mpsc::unbounded_channel();
    let senders = StageSenders {
        validate: validate_tx,
        pack: pack_tx,
        upload: upload_tx,
        download: download_tx,
        unpack: unpack_tx,
        send: send_tx,
    };

    // the DICOM listener runs on its own OS threads; the dispatcher bridges
    // received objects back into this runtime
    let handler = StoreHandler::new(store.clone(), settings.incoming_root.clone(), compile_tx);
    let dispatcher = StoreDispatcher::new(tokio::runtime::Handle::current(), handler);
    let listener_settings = DicomListenerSettings {
        aet: OurAETitle::from(config.store_scp_aet.clone()),
        ..settings.scp.clone()
    };
    let listener_address = SocketAddrV4::new(Ipv4Addr::from(0), config.store_scp_port as u16);
    let listener = Arc::new(DicomListener::new(
        listener_address,
        listener_settings.into(),
        settings.listener_threads.get(),
        settings.scp_max_pdu_length,
        dispatcher,
        finite_connections,
    ));
    listener.start()?;

    let monitor = ServerMonitor::new(store.clone(), remote, settings.monitor_period);
    let monitor_task = tokio::spawn(monitor.run(cancel.clone()));
    let http_task = tokio::spawn(http_api::serve(
        store.clone(),
        settings.http_port,
        cancel.clone(),
    ));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    tokio::try_join!(
        compile_stage_loop(compile_rx, store.clone(), cancel.clone()),
        task_stage_loop("validate", validate_rx, cancel.clone(), async |id| {
            validate::handle_task(&ctx, id).await
        }),
        task_stage_loop("pack", pack_rx, cancel.clone(), async |id| {
            pack::handle_task(&ctx, id).await
        }),
        task_stage_loop("upload", upload_rx, cancel.clone(), async |id| {
            upload::handle_task(&ctx, id).await
        }),
        task_stage_loop("download", download_rx, cancel.clone(), async |id| {
            download::handle_task(&ctx, id).await
        }),
        task_stage_loop("unpack", unpack_rx, cancel.clone(), async |id| {
            unpack::handle_task(&ctx, id).await
        }),
        task_stage_loop("send", send_rx, cancel.clone(), async |id| {
            send::handle_task(&ctx, id).await
        }),
        task_manager_loop(store, senders, settings.server_interaction, cancel.clone()),
    )?;

    monitor_task.abort();
    http_task.abort();
    tokio::task::spawn_blocking(move || listener.stop()).await?;
    Ok(())
}

/// First-boot AppConfig row, seeded from the environment.
fn app_config_defaults(settings: &EnvOptions) -> AppConfig {
    AppConfig {
        client_id: "GenericClient".to_string(),
        min_instances_in_series: 47,
        slice_gap_tolerance: 0.025,
        series_timeout: 30,
        store_scp_port: settings.listener_port as i64,
        store_scp_aet: settings.scp.aet.to_string(),
        ip_address: String::new(),
        mirror_mode: false,
        server_url: settings.server_address.clone(),
        shared_mount_point: settings.shared_mount_point.to_string(),
        zip_dir: "temp/packed_series".to_string(),
        unzip_dir: "temp/unpacked_series".to_string(),
        download_path: "temp/series_to_unpack".to_string(),
    }
}
