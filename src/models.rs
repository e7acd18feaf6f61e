use std::{collections::HashMap, path::PathBuf, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// queued -> running -> (done | error). Nothing ever moves backwards.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running) | (Self::Running, Self::Done) | (Self::Running, Self::Error)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredInputFile {
    pub field: String,
    pub original_name: String,
    pub content_type: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredJobInput {
    pub fields: HashMap<String, Vec<String>>,
    pub files: HashMap<String, Vec<StoredInputFile>>,
    pub total_files: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDownload {
    pub path: PathBuf,
    pub filename: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusPayload {
    pub job_id: String,
    pub tool: Tool,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub tool: Tool,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub work_dir: PathBuf,
    pub input: StoredJobInput,
    pub download: Option<JobDownload>,
}

pub fn expiry_after(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_add_signed(retention))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn download_url(job_id: &str) -> String {
    format!("/api/jobs/{job_id}/download")
}

impl JobRecord {
    pub fn queued(
        id: String,
        tool: Tool,
        work_dir: PathBuf,
        input: StoredJobInput,
        retention: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            tool,
            status: JobStatus::Queued,
            progress: 0,
            message: "Queued".to_string(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            expires_at: expiry_after(now, retention),
            work_dir,
            input,
            download: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent waiting in the queue, once the run has started.
    pub fn queue_wait(&self) -> Option<ChronoDuration> {
        self.started_at.map(|started| started - self.created_at)
    }

    /// Terminal jobs become eligible for sweeping once their retention deadline passes.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_terminal() && now >= self.expires_at
    }

    pub fn begin(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Running) {
            return false;
        }
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.progress = 1;
        self.message = "Running...".to_string();
        self.error_message = None;
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Stores the latest report as-is. Only a running job accepts progress.
    pub fn record_progress(&mut self, progress: u8, message: String) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.progress = progress.min(100);
        self.message = message;
        self.updated_at = Utc::now();
        true
    }

    pub fn complete(&mut self, download: JobDownload, retention: Duration) -> bool {
        if !self.status.can_transition_to(JobStatus::Done) {
            return false;
        }
        let now = Utc::now();
        self.status = JobStatus::Done;
        self.progress = 100;
        self.message = "Done".to_string();
        self.download = Some(download);
        self.error_message = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        self.expires_at = expiry_after(now, retention);
        true
    }

    pub fn fail(&mut self, message: impl Into<String>, retention: Duration) -> bool {
        if !self.status.can_transition_to(JobStatus::Error) {
            return false;
        }
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "Job failed.".to_string();
        }
        let now = Utc::now();
        self.status = JobStatus::Error;
        self.progress = 100;
        self.message = "Error".to_string();
        self.error_message = Some(message);
        self.download = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        self.expires_at = expiry_after(now, retention);
        true
    }

    pub fn to_status(&self) -> JobStatusPayload {
        let message = match (&self.status, &self.error_message) {
            (JobStatus::Error, Some(err)) => err.clone(),
            _ => self.message.clone(),
        };
        JobStatusPayload {
            job_id: self.id.clone(),
            tool: self.tool,
            status: self.status,
            progress: self.progress,
            message,
            download_url: matches!(self.status, JobStatus::Done).then(|| download_url(&self.id)),
            updated_at: self.updated_at,
        }
    }
}
