use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::JobRecord;

/// Process-wide map of job id to record, shared by submission, the pump and the sweeper.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl JobRegistry {
    pub async fn insert(&self, record: JobRecord) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(record.id.clone(), record);
    }

    pub async fn remove(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.write().await.remove(job_id)
    }

    pub async fn read<R>(&self, job_id: &str, f: impl FnOnce(&JobRecord) -> R) -> Option<R> {
        self.jobs.read().await.get(job_id).map(f)
    }

    pub async fn update<R>(&self, job_id: &str, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        self.jobs.write().await.get_mut(job_id).map(f)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Removes every expired terminal job and hands back the directories it owned.
    pub async fn drain_expired(&self, now: DateTime<Utc>) -> Vec<(String, PathBuf)> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<String> = jobs
            .values()
            .filter(|job| job.is_expired(now))
            .map(|job| job.id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| jobs.remove(&id).map(|job| (id, job.work_dir)))
            .collect()
    }
}
