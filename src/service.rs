use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use tokio::{fs, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::JobSettings,
    error::ApiError,
    input_store::{persist_job_input, PartSource},
    models::{JobAccepted, JobDownload, JobRecord, JobStatus, JobStatusPayload, StoredJobInput},
    queue::{self, run_processor},
    registry::JobRegistry,
    tools::{Dispatch, JobContext, ProgressSink, Tool, ToolOutput},
    workspace::{remove_dir_if_exists, sweep_stale_dirs, with_temp_dir, JobDirs},
};

/// External commands never get more than this, even under a longer job deadline.
const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(9 * 60);

/// Owns the job registry and the submission end of the queue. The pump and the
/// sweeper are started alongside it and stopped through [`JobWorkers`].
pub struct JobService {
    settings: JobSettings,
    registry: JobRegistry,
    queue_tx: mpsc::UnboundedSender<String>,
    dispatch: Arc<dyn Dispatch>,
    shutdown: CancellationToken,
}

pub struct JobWorkers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl JobWorkers {
    pub async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("Background worker ended abnormally: {err}");
            }
        }
    }
}

impl JobService {
    pub fn start(settings: JobSettings, dispatch: Arc<dyn Dispatch>) -> (Arc<Self>, JobWorkers) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let service = Arc::new(Self {
            settings,
            registry: JobRegistry::default(),
            queue_tx,
            dispatch,
            shutdown: shutdown.clone(),
        });

        let handles = vec![
            queue::spawn_job_worker(service.clone(), queue_rx, shutdown.clone()),
            queue::spawn_cleanup_worker(service.clone(), shutdown.clone()),
        ];
        (service, JobWorkers { shutdown, handles })
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn dispatch(&self) -> &dyn Dispatch {
        self.dispatch.as_ref()
    }

    fn resolve(&self, slug: &str) -> Result<Tool, ApiError> {
        self.dispatch
            .resolve(slug)
            .ok_or_else(|| ApiError::not_found(format!("Unsupported tool \"{slug}\".")))
    }

    pub(crate) fn context(
        &self,
        job_id: String,
        tool: Tool,
        dirs: &JobDirs,
        input: StoredJobInput,
        progress: ProgressSink,
        deadline: Duration,
    ) -> JobContext {
        JobContext {
            job_id,
            tool,
            work_dir: dirs.work_dir.clone(),
            input_dir: dirs.input_dir.clone(),
            output_dir: dirs.output_dir.clone(),
            input,
            limits: self.settings.limits,
            libreoffice_cmd: self.settings.libreoffice_cmd.clone(),
            command_timeout: deadline.min(MAX_COMMAND_TIMEOUT),
            cancel: self.shutdown.child_token(),
            progress,
        }
    }

    pub async fn submit<S: PartSource>(
        &self,
        slug: &str,
        parts: &mut S,
    ) -> Result<JobAccepted, ApiError> {
        let tool = self.resolve(slug)?;
        let job_id = Uuid::new_v4().to_string();
        let dirs = JobDirs::new(self.settings.job_root.join(&job_id));
        dirs.create().await?;

        let input = match persist_job_input(parts, dirs.input_dir.clone(), self.settings.limits).await
        {
            Ok(input) => input,
            Err(err) => {
                self.discard_dir(&job_id, &dirs).await;
                return Err(err);
            }
        };
        let (files, bytes) = (input.total_files, input.total_bytes);

        let record = JobRecord::queued(
            job_id.clone(),
            tool,
            dirs.work_dir.clone(),
            input,
            self.settings.retention,
        );
        self.registry.insert(record).await;

        if self.queue_tx.send(job_id.clone()).is_err() {
            self.registry.remove(&job_id).await;
            self.discard_dir(&job_id, &dirs).await;
            return Err(ApiError::Unavailable("Job queue is unavailable.".to_string()));
        }

        info!(job_id = %job_id, tool = %tool, files, bytes, "Job queued");
        Ok(JobAccepted { job_id })
    }

    async fn discard_dir(&self, job_id: &str, dirs: &JobDirs) {
        if let Err(err) = remove_dir_if_exists(&dirs.work_dir).await {
            warn!(job_id = %job_id, "Failed to remove rejected job directory: {err:#}");
        }
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatusPayload, ApiError> {
        self.registry
            .read(job_id, JobRecord::to_status)
            .await
            .ok_or_else(|| ApiError::not_found("Job not found."))
    }

    pub async fn download(&self, job_id: &str) -> Result<JobDownload, ApiError> {
        self.registry
            .read(job_id, |job| match (job.status, &job.download) {
                (JobStatus::Done, Some(download)) => Ok(download.clone()),
                (JobStatus::Error, _) => Err(ApiError::conflict(
                    job.error_message
                        .clone()
                        .unwrap_or_else(|| "Job failed.".to_string()),
                )),
                _ => Err(ApiError::conflict("Job output is not ready yet.")),
            })
            .await
            .unwrap_or_else(|| Err(ApiError::not_found("Job not found.")))
    }

    /// Runs a tool right away inside a throwaway workspace and hands back the
    /// output bytes; nothing is registered or queued.
    pub async fn run_now<S: PartSource>(
        &self,
        slug: &str,
        parts: &mut S,
        deadline: Duration,
    ) -> Result<(ToolOutput, Vec<u8>), ApiError> {
        let tool = self.resolve(slug)?;
        with_temp_dir(&self.settings.tmp_root, tool.slug(), |work_dir| async move {
            let dirs = JobDirs::new(work_dir);
            dirs.create().await?;
            let input = persist_job_input(parts, dirs.input_dir.clone(), self.settings.limits).await?;
            let ctx = self.context(
                format!("sync-{}", Uuid::new_v4()),
                tool,
                &dirs,
                input,
                ProgressSink::Detached,
                deadline,
            );
            let output = run_processor(self.dispatch(), tool, ctx, deadline, "Request").await?;
            let bytes = fs::read(&output.output_path).await.map_err(anyhow::Error::from)?;
            Ok::<_, ApiError>((output, bytes))
        })
        .await
    }

    /// Drops every expired terminal job and deletes its directory. Deletion
    /// failures are logged; the record is gone either way.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.registry.drain_expired(Utc::now()).await;
        for (job_id, work_dir) in &expired {
            match remove_dir_if_exists(work_dir).await {
                Ok(()) => info!(job_id = %job_id, "Expired job swept"),
                Err(err) => warn!(job_id = %job_id, "Failed to delete expired job directory: {err:#}"),
            }
        }
        if !expired.is_empty() {
            let remaining = self.registry.len().await;
            info!(swept = expired.len(), remaining, "Expiry sweep finished");
        }
        expired.len()
    }

    pub async fn sweep_stale_workspaces(&self) -> Result<usize> {
        sweep_stale_dirs(&self.settings.tmp_root, self.settings.tmp_ttl).await
    }
}
