use std::{
    future::Future,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JobDirs {
    pub work_dir: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl JobDirs {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            input_dir: work_dir.join("input"),
            output_dir: work_dir.join("output"),
            work_dir,
        }
    }

    pub async fn create(&self) -> Result<()> {
        for dir in [&self.input_dir, &self.output_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create job directory {}", dir.display()))?;
        }
        Ok(())
    }
}

pub async fn ensure_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create workspace root at {}", path.display()))
}

pub async fn create_temp_dir(root: &Path, prefix: &str) -> Result<PathBuf> {
    ensure_root(root).await?;
    let dir = root.join(format!("{prefix}-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create temp directory {}", dir.display()))?;
    Ok(dir)
}

/// Runs `action` inside a fresh directory under `root`; the directory is removed
/// afterwards whether the action succeeded or not.
pub async fn with_temp_dir<T, E, F, Fut>(root: &Path, prefix: &str, action: F) -> Result<T, E>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<anyhow::Error>,
{
    let dir = create_temp_dir(root, prefix).await?;
    let result = action(dir.clone()).await;
    if let Err(err) = remove_dir_if_exists(&dir).await {
        warn!("Failed to remove temp directory {}: {err:#}", dir.display());
    }
    result
}

pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

/// Removes direct subdirectories of `root` last modified more than `ttl` ago.
pub async fn sweep_stale_dirs(root: &Path, ttl: Duration) -> Result<usize> {
    ensure_root(root).await?;
    let now = SystemTime::now();
    let mut removed = 0;

    let mut entries = fs::read_dir(root)
        .await
        .with_context(|| format!("Failed to list {}", root.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        // Entries can vanish underneath us when another sweep races this one.
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= ttl {
            continue;
        }
        if remove_dir_if_exists(&path).await.is_ok() {
            removed += 1;
        }
    }

    if removed > 0 {
        info!(root = %root.display(), removed, "Removed stale temp workspaces");
    }
    Ok(removed)
}
