use std::{ffi::OsStr, path::Path, process::Stdio, time::Duration};

use anyhow::Context;
use tokio::{process::Command, time};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ApiError;

/// Runs an external binary to completion and returns its stdout. The child is killed when the deadline
/// passes, when `cancel` fires, or when the returned future is dropped.
pub async fn run_command<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, ApiError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::Unavailable(format!(
                "Required command \"{program}\" is missing."
            )));
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("Failed to run command \"{program}\""))
                .into());
        }
    };
    debug!(program, "Spawned command");

    let output = tokio::select! {
        output = child.wait_with_output() => {
            output.with_context(|| format!("Failed waiting for command \"{program}\""))?
        }
        _ = time::sleep(timeout) => {
            return Err(ApiError::Timeout(format!(
                "Command \"{program}\" timed out after {} seconds.",
                timeout.as_secs()
            )));
        }
        _ = cancel.cancelled() => {
            return Err(ApiError::Timeout(format!("Command \"{program}\" was stopped.")));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
        return Err(ApiError::bad_request(
            format!("Command \"{program}\" failed with code {code}. {}", detail.trim())
                .trim()
                .to_string(),
        ));
    }

    debug!(program, stderr = %stderr.trim(), "Command finished");
    Ok(stdout)
}
