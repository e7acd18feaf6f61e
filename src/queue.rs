use std::{path::Path, sync::Arc, time::Duration};

use tokio::{fs, sync::mpsc, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::ApiError,
    models::JobDownload,
    service::JobService,
    tools::{Dispatch, JobContext, ProgressSink, Tool, ToolOutput},
    workspace::JobDirs,
};

/// Single consumer of the job queue: jobs run strictly one at a time in FIFO order.
pub fn spawn_job_worker(
    service: Arc<JobService>,
    mut queue_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let job_id = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = queue_rx.recv() => match next {
                    Some(job_id) => job_id,
                    None => break,
                },
            };
            info!(job_id = %job_id, "Worker picked job");
            run_job(&service, &job_id).await;
        }
        info!("Job worker stopped");
    })
}

pub fn spawn_cleanup_worker(service: Arc<JobService>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut expiry = time::interval(service.settings().sweep_interval);
        let mut stale = time::interval(service.settings().stale_sweep_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = expiry.tick() => {
                    service.sweep_expired().await;
                }
                _ = stale.tick() => {
                    if let Err(err) = service.sweep_stale_workspaces().await {
                        warn!("Stale workspace sweep error: {err:#}");
                    }
                }
            }
        }
        info!("Cleanup worker stopped");
    })
}

async fn run_job(service: &JobService, job_id: &str) {
    let registry = service.registry();
    let started = registry
        .update(job_id, |job| {
            job.begin().then(|| {
                let waited_ms = job.queue_wait().map(|d| d.num_milliseconds()).unwrap_or(0);
                (job.tool, job.work_dir.clone(), job.input.clone(), waited_ms)
            })
        })
        .await
        .flatten();
    let Some((tool, work_dir, input, waited_ms)) = started else {
        info!(job_id = %job_id, "Skipping job: missing or no longer queued");
        return;
    };
    info!(job_id = %job_id, tool = %tool, waited_ms, "Job started");

    let settings = service.settings();
    let ctx = service.context(
        job_id.to_string(),
        tool,
        &JobDirs::new(work_dir),
        input,
        ProgressSink::Registry(registry.clone()),
        settings.timeout,
    );

    let retention = settings.retention;
    match run_processor(service.dispatch(), tool, ctx, settings.timeout, "Job").await {
        Ok(output) => {
            let download = JobDownload {
                path: output.output_path,
                filename: output.filename,
                content_type: output.content_type,
            };
            let filename = download.filename.clone();
            registry
                .update(job_id, |job| job.complete(download, retention))
                .await;
            info!(job_id = %job_id, tool = %tool, file = %filename, "Job completed");
        }
        Err(err) => {
            if matches!(err, ApiError::Unexpected(_)) {
                error!(job_id = %job_id, tool = %tool, "Job failed unexpectedly: {err:#}");
            } else {
                warn!(job_id = %job_id, tool = %tool, error = %err, "Job failed");
            }
            let message = err.user_message();
            registry
                .update(job_id, |job| job.fail(message, retention))
                .await;
        }
    }
}

/// Races the processor against `deadline` and shutdown. The processor runs in its
/// own task so a panic stays contained; when either fires first its token is
/// cancelled and the task aborted.
pub(crate) async fn run_processor(
    dispatch: &dyn Dispatch,
    tool: Tool,
    ctx: JobContext,
    deadline: Duration,
    label: &str,
) -> Result<ToolOutput, ApiError> {
    let cancel = ctx.cancel.clone();
    let work_dir = ctx.work_dir.clone();
    let mut handle = tokio::spawn(dispatch.run(tool, ctx));

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = time::sleep(deadline) => {
            cancel.cancel();
            handle.abort();
            return Err(ApiError::Timeout(format!(
                "{label} exceeded {} and was stopped.",
                describe_duration(deadline)
            )));
        }
        _ = cancel.cancelled() => {
            handle.abort();
            return Err(ApiError::Unavailable(format!(
                "{label} was stopped because the service is shutting down."
            )));
        }
    };

    let output = match joined {
        Ok(result) => result?,
        Err(err) => {
            return Err(anyhow::anyhow!("Processor task for {tool} failed: {err}").into());
        }
    };
    validate_output(&output, &work_dir).await?;
    Ok(output)
}

async fn validate_output(output: &ToolOutput, work_dir: &Path) -> Result<(), ApiError> {
    if !output.output_path.starts_with(work_dir) {
        return Err(ApiError::Internal(format!(
            "Generated output \"{}\" is outside the job directory.",
            output.filename
        )));
    }
    match fs::metadata(&output.output_path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(ApiError::Internal(format!(
            "Generated output \"{}\" is empty.",
            output.filename
        ))),
    }
}

fn describe_duration(duration: Duration) -> String {
    let plural = |n: u128, unit: &str| {
        if n == 1 {
            format!("1 {unit}")
        } else {
            format!("{n} {unit}s")
        }
    };
    let millis = duration.as_millis();
    if millis >= 60_000 && millis % 60_000 == 0 {
        plural(millis / 60_000, "minute")
    } else if millis >= 1_000 && millis % 1_000 == 0 {
        plural(millis / 1_000, "second")
    } else {
        plural(millis, "millisecond")
    }
}
