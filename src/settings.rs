//! Petrelay settings, which are configurable using environment variables.
use crate::dicom_settings::DicomListenerSettings;
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::num::NonZeroUsize;

/// Process-level options, read once at start. Settings which the operator
/// may edit at runtime live in the task store instead ([crate::models::AppConfig]);
/// the values here seed that row on first boot.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvOptions {
    /// sqlx connection URL of the task store.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Root directory for received and rebuilt DICOM files.
    #[serde(default = "default_incoming_root")]
    pub incoming_root: Utf8PathBuf,
    /// Address of the remote processing server, `host:port`.
    pub server_address: String,
    /// Mount point of the drop-box shared with the remote server.
    #[serde(default = "default_shared_mount_point")]
    pub shared_mount_point: Utf8PathBuf,
    /// Whether to talk to the remote server. When off, the task manager
    /// emulates remote processing locally.
    #[serde(default = "default_server_interaction")]
    pub server_interaction: bool,
    /// Port of the local HTTP API (`/process_ready` callback).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub scp: DicomListenerSettings,
    #[serde(default = "default_max_pdu_length")]
    pub scp_max_pdu_length: usize,
    #[serde(default = "default_listener_threads")]
    pub listener_threads: NonZeroUsize,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// Remote liveness probe period.
    #[serde(with = "humantime_serde", default = "default_monitor_period")]
    pub monitor_period: std::time::Duration,
}

fn default_database_url() -> String {
    "sqlite://petrelay.db".to_string()
}

fn default_incoming_root() -> Utf8PathBuf {
    Utf8PathBuf::from("incoming")
}

fn default_shared_mount_point() -> Utf8PathBuf {
    Utf8PathBuf::from("shared")
}

fn default_server_interaction() -> bool {
    true
}

fn default_http_port() -> u16 {
    8000
}

fn default_listener_threads() -> NonZeroUsize {
    NonZeroUsize::new(8).unwrap()
}

fn default_listener_port() -> u16 {
    11113
}

fn default_max_pdu_length() -> usize {
    16384
}

fn default_monitor_period() -> std::time::Duration {
    std::time::Duration::from_secs(1)
}
