use std::{future::Future, path::PathBuf};

use anyhow::Context;
use tokio::fs;
use tracing::debug;

use crate::{
    config::UploadLimits,
    error::ApiError,
    models::{StoredInputFile, StoredJobInput},
};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub enum SubmissionPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

/// Yields the parts of one submission in arrival order.
pub trait PartSource: Send {
    fn next_part(&mut self) -> impl Future<Output = Result<Option<SubmissionPart>, ApiError>> + Send;
}

impl PartSource for std::vec::IntoIter<SubmissionPart> {
    async fn next_part(&mut self) -> Result<Option<SubmissionPart>, ApiError> {
        Ok(self.next())
    }
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn check_file_size(limits: &UploadLimits, file_name: &str, size: u64) -> Result<(), ApiError> {
    if size > limits.max_file_bytes() {
        return Err(ApiError::bad_request(format!(
            "\"{file_name}\" exceeds {}MB limit.",
            limits.max_file_bytes() / MIB
        )));
    }
    Ok(())
}

/// Persists parts into `input_dir` one at a time, enforcing the upload limits
/// before each file is written.
pub struct JobInputWriter {
    input_dir: PathBuf,
    limits: UploadLimits,
    input: StoredJobInput,
    file_index: usize,
}

impl JobInputWriter {
    pub fn new(input_dir: PathBuf, limits: UploadLimits) -> Self {
        Self {
            input_dir,
            limits,
            input: StoredJobInput::default(),
            file_index: 0,
        }
    }

    pub fn push_field(&mut self, name: String, value: String) {
        self.input.fields.entry(name).or_default().push(value);
    }

    pub async fn push_file(
        &mut self,
        name: String,
        file_name: String,
        content_type: Option<String>,
        data: &[u8],
    ) -> Result<(), ApiError> {
        let size = data.len() as u64;
        self.input.total_files += 1;
        self.input.total_bytes += size;

        if self.input.total_files > self.limits.max_files {
            return Err(ApiError::bad_request(format!(
                "You can upload up to {} files at once.",
                self.limits.max_files
            )));
        }
        check_file_size(&self.limits, &file_name, size)?;

        let safe_name = if file_name.is_empty() {
            format!("upload-{}", self.file_index)
        } else {
            sanitize_filename(&file_name)
        };
        let target = self
            .input_dir
            .join(format!("{:03}-{safe_name}", self.file_index));
        fs::write(&target, data)
            .await
            .with_context(|| format!("Failed to write upload {}", target.display()))?;
        debug!(path = %target.display(), size, "Stored upload part");

        let original_name = if file_name.is_empty() {
            safe_name
        } else {
            file_name
        };
        self.input.files.entry(name.clone()).or_default().push(StoredInputFile {
            field: name,
            original_name,
            content_type: content_type
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size,
            path: target,
        });
        self.file_index += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<StoredJobInput, ApiError> {
        if self.input.total_files > 0 && self.input.total_bytes > self.limits.max_total_bytes() {
            return Err(ApiError::bad_request(format!(
                "Total upload size exceeds {}MB limit.",
                self.limits.max_total_bytes() / MIB
            )));
        }
        Ok(self.input)
    }
}

pub async fn persist_job_input<S: PartSource>(
    source: &mut S,
    input_dir: PathBuf,
    limits: UploadLimits,
) -> Result<StoredJobInput, ApiError> {
    let mut writer = JobInputWriter::new(input_dir, limits);
    while let Some(part) = source.next_part().await? {
        match part {
            SubmissionPart::Text { name, value } => writer.push_field(name, value),
            SubmissionPart::File {
                name,
                file_name,
                content_type,
                data,
            } => writer.push_file(name, file_name, content_type, &data).await?,
        }
    }
    writer.finish()
}
