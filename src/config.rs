use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use serde::Serialize;

const MIB: u64 = 1024 * 1024;

/// Upper bound for every minute-based setting (one week).
const MAX_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadLimits {
    pub max_files: usize,
    pub max_file_mb: u64,
    pub max_total_mb: u64,
    pub max_pages: usize,
}

impl UploadLimits {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb.saturating_mul(MIB)
    }

    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_mb.saturating_mul(MIB)
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_file_mb: 100,
            max_total_mb: 300,
            max_pages: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub job_root: PathBuf,
    pub timeout: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub tmp_root: PathBuf,
    pub tmp_ttl: Duration,
    pub limits: UploadLimits,
    pub libreoffice_cmd: Option<String>,
}

impl JobSettings {
    pub fn stale_sweep_interval(&self) -> Duration {
        self.sweep_interval
            .saturating_mul(5)
            .clamp(Duration::from_secs(60), minutes(MAX_MINUTES))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub request_timeout: Duration,
    pub jobs: JobSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let defaults = UploadLimits::default();
        let limits = UploadLimits {
            max_files: env_positive("MAX_FILES", defaults.max_files as u64) as usize,
            max_file_mb: env_positive("MAX_FILE_MB", defaults.max_file_mb),
            max_total_mb: env_positive("MAX_TOTAL_MB", defaults.max_total_mb),
            max_pages: env_positive("MAX_PAGES", defaults.max_pages as u64) as usize,
        };

        let job_root = env::var("JOB_ROOT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("pdf-workbench-jobs"));

        let tmp_dir = env::var("TMP_DIR").unwrap_or_else(|_| "data/tmp".to_string());
        let tmp_root = resolve_relative(PathBuf::from(tmp_dir))?;

        let libreoffice_cmd = env::var("LIBREOFFICE_CMD")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            bind_addr,
            request_timeout: Duration::from_secs(env_positive("REQUEST_TIMEOUT_SEC", 120)),
            jobs: JobSettings {
                job_root,
                timeout: env_minutes("JOB_TIMEOUT_MINUTES", 10),
                retention: env_minutes("JOB_RETENTION_MINUTES", 30),
                sweep_interval: Duration::from_secs(
                    env_positive("JOB_SWEEP_INTERVAL_SECONDS", 60).min(MAX_MINUTES * 60),
                ),
                tmp_root,
                tmp_ttl: env_minutes("TMP_TTL_MINUTES", 20),
                limits,
                libreoffice_cmd,
            },
        })
    }
}

fn resolve_relative(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(env::current_dir()?.join(path))
}

fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.min(MAX_MINUTES) * 60)
}

fn env_minutes(name: &str, fallback: u64) -> Duration {
    minutes(env_positive(name, fallback))
}

fn env_positive(name: &str, fallback: u64) -> u64 {
    parse_positive(env::var(name).ok().as_deref(), fallback)
}

fn parse_positive(raw: Option<&str>, fallback: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_or_garbage_values_fall_back() {
        assert_eq!(parse_positive(None, 20), 20);
        assert_eq!(parse_positive(Some("0"), 20), 20);
        assert_eq!(parse_positive(Some("-3"), 20), 20);
        assert_eq!(parse_positive(Some("abc"), 20), 20);
        assert_eq!(parse_positive(Some(" 7 "), 20), 7);
    }

    #[test]
    fn oversized_values_saturate_instead_of_overflowing() {
        assert_eq!(minutes(u64::MAX), Duration::from_secs(MAX_MINUTES * 60));
        assert_eq!(minutes(30), Duration::from_secs(1800));

        let limits = UploadLimits {
            max_file_mb: u64::MAX,
            max_total_mb: u64::MAX / 2,
            ..UploadLimits::default()
        };
        assert_eq!(limits.max_file_bytes(), u64::MAX);
        assert_eq!(limits.max_total_bytes(), u64::MAX);

        let settings = JobSettings {
            job_root: PathBuf::from("/tmp/jobs"),
            timeout: minutes(10),
            retention: minutes(30),
            sweep_interval: Duration::MAX,
            tmp_root: PathBuf::from("/tmp/tmp"),
            tmp_ttl: minutes(20),
            limits,
            libreoffice_cmd: None,
        };
        assert_eq!(settings.stale_sweep_interval(), minutes(MAX_MINUTES));
    }

    #[test]
    fn limits_serialize_in_camel_case() {
        let value = serde_json::to_value(UploadLimits::default()).expect("serialize limits");
        assert_eq!(value["maxFiles"], 20);
        assert_eq!(value["maxFileMb"], 100);
        assert_eq!(value["maxTotalMb"], 300);
        assert_eq!(value["maxPages"], 500);
    }
}
