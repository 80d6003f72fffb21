//! Analysis pipeline stages and the statuses the backend reports for them

use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// GEM2S (count matrix ingestion) usually completes within minutes
pub const GEM2S_STEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// QC (data processing) can run for tens of minutes
pub const QC_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A long-running backend stage of the analysis pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Gem2s,
    Qc,
}

impl PipelineStage {
    /// Key of this stage in the `backendStatus` document
    pub fn backend_key(&self) -> &'static str {
        match self {
            PipelineStage::Gem2s => "gem2s",
            PipelineStage::Qc => "pipeline",
        }
    }

    /// Value of the `type` field in pushed experiment updates
    pub fn update_type(&self) -> &'static str {
        match self {
            PipelineStage::Gem2s => "gem2s",
            PipelineStage::Qc => "qc",
        }
    }

    pub fn from_update_type(value: &str) -> Option<Self> {
        match value {
            "gem2s" => Some(PipelineStage::Gem2s),
            "qc" => Some(PipelineStage::Qc),
            _ => None,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            PipelineStage::Gem2s => GEM2S_STEP_TIMEOUT,
            PipelineStage::Qc => QC_STEP_TIMEOUT,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Gem2s => write!(f, "GEM2S"),
            PipelineStage::Qc => write!(f, "QC"),
        }
    }
}

/// Identifies one stage of one experiment's pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub experiment_id: String,
    pub stage: PipelineStage,
}

impl JobId {
    pub fn new(experiment_id: impl Into<String>, stage: PipelineStage) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            stage,
        }
    }

    pub fn gem2s(experiment_id: impl Into<String>) -> Self {
        Self::new(experiment_id, PipelineStage::Gem2s)
    }

    pub fn qc(experiment_id: impl Into<String>) -> Self {
        Self::new(experiment_id, PipelineStage::Qc)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of experiment {}", self.stage, self.experiment_id)
    }
}

/// Status of a pipeline stage as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotCreated,
    Running,
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
    Unknown(String),
}

impl JobStatus {
    /// Parse the backend's status string (e.g. `SUCCEEDED`)
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "NOT_CREATED" => JobStatus::NotCreated,
            "RUNNING" => JobStatus::Running,
            "SUCCEEDED" => JobStatus::Succeeded,
            "FAILED" => JobStatus::Failed,
            "ABORTED" => JobStatus::Aborted,
            "TIMED_OUT" => JobStatus::TimedOut,
            _ => JobStatus::Unknown(value.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Aborted | JobStatus::TimedOut)
    }

    /// No further transition happens from a terminal status
    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::NotCreated => write!(f, "NOT_CREATED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Succeeded => write!(f, "SUCCEEDED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Aborted => write!(f, "ABORTED"),
            JobStatus::TimedOut => write!(f, "TIMED_OUT"),
            JobStatus::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// A status change pushed by the backend for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job: JobId,
    pub status: JobStatus,
}

/// Extract one stage's status from a `backendStatus` document.
///
/// A missing stage means the backend never created it.
pub fn status_from_backend(doc: &serde_json::Value, stage: PipelineStage) -> JobStatus {
    doc.get(stage.backend_key())
        .and_then(|s| s.get("status"))
        .and_then(|s| s.as_str())
        .map(JobStatus::parse)
        .unwrap_or(JobStatus::NotCreated)
}
