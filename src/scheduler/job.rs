use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
        }
    }
}

/// How a finished command ended. A failing command still completes its job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { exit_code: Option<i32> },
    TimedOut { after_secs: u64 },
    SpawnFailed { message: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Succeeded => write!(f, "succeeded"),
            JobOutcome::Failed {
                exit_code: Some(code),
            } => write!(f, "failed (exit code {})", code),
            JobOutcome::Failed { exit_code: None } => write!(f, "failed (killed by signal)"),
            JobOutcome::TimedOut { after_secs } => write!(f, "timed out after {}s", after_secs),
            JobOutcome::SpawnFailed { message } => write!(f, "spawn failed: {}", message),
        }
    }
}

/// One command-execution request, persisted as the job's JSON marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub command: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub inputs: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub work_dir: PathBuf,
    pub status: JobStatus,
    /// Input file path -> modification time recorded at submission.
    #[serde(default)]
    pub input_file_timestamps: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: JobId, template: String, work_dir: PathBuf) -> Self {
        Self {
            id,
            command: String::new(),
            template,
            tool: None,
            inputs: BTreeMap::new(),
            created_at: Utc::now(),
            work_dir,
            status: JobStatus::Pending,
            input_file_timestamps: BTreeMap::new(),
            outcome: None,
            completed_at: None,
        }
    }

    /// Unix milliseconds of `created_at`, shared by every artifact name of the job.
    pub fn timestamp_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    pub fn marker_path(&self) -> PathBuf {
        self.work_dir
            .join(artifact_name(self.id, self.timestamp_millis(), "info.json"))
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.work_dir
            .join(artifact_name(self.id, self.timestamp_millis(), "stdout.txt"))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.work_dir
            .join(artifact_name(self.id, self.timestamp_millis(), "stderr.txt"))
    }

    /// Write the marker atomically: serialize to a sibling temp file, then rename.
    pub async fn write_marker(&self) -> Result<()> {
        let path = self.marker_path();
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn read_marker(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Modification time of `path` as recorded in `input_file_timestamps`.
pub async fn modified_at(path: &Path) -> std::io::Result<DateTime<Utc>> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(DateTime::<Utc>::from(meta.modified()?))
}

fn artifact_name(id: JobId, millis: i64, suffix: &str) -> String {
    format!("request_{}_{}_{}", id, millis, suffix)
}

/// Returns true if `file_name` is the info marker of job `id`.
pub fn is_marker_name(file_name: &str, id: JobId) -> bool {
    let Some(rest) = file_name.strip_prefix(&format!("request_{}_", id)) else {
        return false;
    };
    match rest.strip_suffix("_info.json") {
        Some(millis) => !millis.is_empty() && millis.parse::<i64>().is_ok(),
        None => false,
    }
}
