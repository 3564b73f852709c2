//! Periodic liveness probe of the remote processing server.
use crate::remote::RemoteClient;
use crate::task_store::TaskStore;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unknown,
    Alive,
    NotAvailable,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::Unknown => "Unknown",
            ServerState::Alive => "Alive",
            ServerState::NotAvailable => "Not available",
        })
    }
}

/// Connectivity statistics, exposed to the control surface.
#[derive(Debug, Clone)]
pub struct MonitorStats {
    pub state: ServerState,
    pub current_state_duration: Duration,
    pub total_disconnections: u64,
    pub total_uptime: Duration,
    pub total_downtime: Duration,
}

impl Default for MonitorStats {
    fn default() -> Self {
        Self {
            state: ServerState::Unknown,
            current_state_duration: Duration::ZERO,
            total_disconnections: 0,
            total_uptime: Duration::ZERO,
            total_downtime: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub struct ServerMonitor {
    store: TaskStore,
    remote: RemoteClient,
    period: Duration,
    stats: Arc<Mutex<MonitorStats>>,
}

impl ServerMonitor {
    pub fn new(store: TaskStore, remote: RemoteClient, period: Duration) -> Self {
        Self {
            store,
            remote,
            period,
            stats: Arc::new(Mutex::new(MonitorStats::default())),
        }
    }

    pub fn snapshot(&self) -> MonitorStats {
        self.stats.lock().unwrap().clone()
    }

    /// Probe `{server_url}/check_ping` every period, tracking state flips
    /// and cumulative up/down time.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("server monitor started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
            let server_url = match self.store.app_config().await {
                Ok(config) => config.server_url,
                Err(e) => {
                    tracing::error!("server monitor cannot read the app config: {e}");
                    continue;
                }
            };
            let probe_start = Instant::now();
            let alive = self.remote.check_ping(&server_url).await;
            let elapsed = probe_start.elapsed();

            let mut stats = self.stats.lock().unwrap();
            let was_alive = stats.state == ServerState::Alive;
            match (was_alive, alive) {
                (true, true) => {
                    stats.total_uptime += self.period + elapsed;
                    stats.current_state_duration += self.period + elapsed;
                }
                (true, false) => {
                    stats.total_disconnections += 1;
                    stats.current_state_duration = elapsed;
                }
                (false, true) => {
                    stats.current_state_duration = elapsed;
                }
                (false, false) => {
                    stats.total_downtime += self.period + elapsed;
                    stats.current_state_duration += self.period + elapsed;
                }
            }
            stats.state = if alive {
                ServerState::Alive
            } else {
                ServerState::NotAvailable
            };
        }
    }
}
