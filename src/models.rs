//! Rows of the task store.
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// A stage of the processing pipeline. `current_step` of a [Task] names the
/// stage which owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Compile,
    Validate,
    Pack,
    Upload,
    Download,
    Unpack,
    Send,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Compile => "compile",
            Stage::Validate => "validate",
            Stage::Pack => "pack",
            Stage::Upload => "upload",
            Stage::Download => "download",
            Stage::Unpack => "unpack",
            Stage::Send => "send",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(Stage::Compile),
            "validate" => Ok(Stage::Validate),
            "pack" => Ok(Stage::Pack),
            "upload" => Ok(Stage::Upload),
            "download" => Ok(Stage::Download),
            "unpack" => Ok(Stage::Unpack),
            "send" => Ok(Stage::Send),
            _ => Err(UnknownStage(s.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown pipeline stage: \"{0}\"")]
pub struct UnknownStage(pub String);

/// Step state of a [Task].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Failed,
    Processing,
    StepDone,
    Completed,
}

impl StepState {
    pub fn as_i64(&self) -> i64 {
        match self {
            StepState::Failed => -1,
            StepState::Processing => 0,
            StepState::StepDone => 1,
            StepState::Completed => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            -1 => Some(StepState::Failed),
            0 => Some(StepState::Processing),
            1 => Some(StepState::StepDone),
            2 => Some(StepState::Completed),
            _ => None,
        }
    }

    /// Terminal states, from which operator actions may revive a task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Failed | StepState::Completed)
    }
}

/// One study-to-result unit of work, durable across restarts.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub started: OffsetDateTime,
    pub updated: OffsetDateTime,
    pub current_step: Stage,
    /// Serialized [crate::metadata_bag::MetadataBag] of the canonical instance.
    pub recon_settings: Option<String>,
    pub step_state: StepState,
    pub status_msg: Option<String>,
    pub full_status_msg: Option<String>,
    pub imgs: i64,
    pub expected_imgs: Option<i64>,
    pub visible: bool,
    /// Source series UID.
    pub series: Option<String>,
    /// Source device identifier, `"{AET}@{IP}"`.
    pub source: Option<String>,
    pub radiopharmaceutical: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Patient {
    pub patient_id: String,
    pub patient_name: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Study {
    pub study_uid: String,
    pub study_date: Option<OffsetDateTime>,
    pub study_description: Option<String>,
    pub patient_id: Option<String>,
    pub patient_weight: Option<f64>,
    pub patient_size: Option<f64>,
    pub patient_age: Option<String>,
    pub stored_in: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Series {
    pub series_uid: String,
    pub series_date: Option<OffsetDateTime>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    pub series_number: Option<i64>,
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    /// Set on result series only, to the id of the task which produced them.
    pub originating_task: Option<String>,
    pub stored_in: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Instance {
    pub sop_uid: String,
    pub sop_class_uid: Option<String>,
    pub filename: String,
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
}

/// A configured DICOM peer.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Device {
    pub name: String,
    pub ae_title: String,
    pub address: String,
    pub port: i64,
    pub is_destination: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Radiopharmaceutical {
    pub name: String,
    /// Comma-separated names as they appear in DICOM headers.
    pub synonyms: String,
    pub half_life: Option<f64>,
}

impl Radiopharmaceutical {
    /// Whether `label` is one of the names this radiopharmaceutical goes by.
    pub fn matches(&self, label: &str) -> bool {
        !label.is_empty() && self.synonyms.contains(label)
    }
}

/// How a post-filter names its result series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// `"{original}_{description}"`
    Append,
    /// `"{description}"`
    Replace,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Append => "append",
            FilterMode::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "replace" {
            FilterMode::Replace
        } else {
            FilterMode::Append
        }
    }
}

/// One post-filter configuration applied at unpack time.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub id: i64,
    /// Gaussian kernel size in mm, 0 for identity.
    pub fwhm: f64,
    pub description: String,
    pub mode: FilterMode,
    pub series_number: i64,
    /// Percentage of the noise volume added back before filtering.
    pub noise: f64,
    /// Scanner model this filter applies to, or "all".
    pub model: String,
    /// Radiopharmaceutical name this filter applies to, or "all".
    pub radiopharmaceutical: String,
    pub enabled: bool,
}

impl FilterSettings {
    /// The single identity pass used when no filters are configured at all.
    pub fn identity() -> Self {
        Self {
            id: 0,
            fwhm: 0.0,
            description: "PETFECTIOR".to_string(),
            mode: FilterMode::Replace,
            series_number: 1001,
            noise: 0.0,
            model: "all".to_string(),
            radiopharmaceutical: "all".to_string(),
            enabled: true,
        }
    }
}

/// The singleton runtime configuration row, created from defaults on first
/// boot and edited through the admin surface.
#[derive(Debug, Clone, FromRow)]
pub struct AppConfig {
    pub client_id: String,
    pub min_instances_in_series: i64,
    pub slice_gap_tolerance: f64,
    /// Seconds a series may sit incomplete before the compile sweep decides.
    pub series_timeout: i64,
    pub store_scp_port: i64,
    pub store_scp_aet: String,
    pub ip_address: String,
    pub mirror_mode: bool,
    pub server_url: String,
    pub shared_mount_point: String,
    pub zip_dir: String,
    pub unzip_dir: String,
    pub download_path: String,
}
