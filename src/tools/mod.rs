mod command;
mod common;
mod external;
mod overlay;
mod pages;
mod pdf;
mod spreadsheet;

use std::{fmt, future::Future, path::PathBuf, pin::Pin, time::Duration};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{config::UploadLimits, error::ApiError, models::StoredJobInput, registry::JobRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    MergePdf,
    SplitPdf,
    RotatePdf,
    CompressPdf,
    ProtectPdf,
    UnlockPdf,
    WordToPdf,
    PowerpointToPdf,
    ExcelToPdf,
    PdfToJpg,
    JpgToPdf,
    Watermark,
    EditPdf,
    SignPdf,
    HtmlToPdf,
    PdfToWord,
    PdfToPowerpoint,
    PdfToExcel,
}

impl Tool {
    pub const ALL: [Tool; 18] = [
        Tool::MergePdf,
        Tool::SplitPdf,
        Tool::RotatePdf,
        Tool::CompressPdf,
        Tool::ProtectPdf,
        Tool::UnlockPdf,
        Tool::WordToPdf,
        Tool::PowerpointToPdf,
        Tool::ExcelToPdf,
        Tool::PdfToJpg,
        Tool::JpgToPdf,
        Tool::Watermark,
        Tool::EditPdf,
        Tool::SignPdf,
        Tool::HtmlToPdf,
        Tool::PdfToWord,
        Tool::PdfToPowerpoint,
        Tool::PdfToExcel,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Tool::MergePdf => "merge-pdf",
            Tool::SplitPdf => "split-pdf",
            Tool::RotatePdf => "rotate-pdf",
            Tool::CompressPdf => "compress-pdf",
            Tool::ProtectPdf => "protect-pdf",
            Tool::UnlockPdf => "unlock-pdf",
            Tool::WordToPdf => "word-to-pdf",
            Tool::PowerpointToPdf => "powerpoint-to-pdf",
            Tool::ExcelToPdf => "excel-to-pdf",
            Tool::PdfToJpg => "pdf-to-jpg",
            Tool::JpgToPdf => "jpg-to-pdf",
            Tool::Watermark => "watermark",
            Tool::EditPdf => "edit-pdf",
            Tool::SignPdf => "sign-pdf",
            Tool::HtmlToPdf => "html-to-pdf",
            Tool::PdfToWord => "pdf-to-word",
            Tool::PdfToPowerpoint => "pdf-to-powerpoint",
            Tool::PdfToExcel => "pdf-to-excel",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Tool> {
        Tool::ALL.into_iter().find(|tool| tool.slug() == slug)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub output_path: PathBuf,
    pub filename: String,
    pub content_type: String,
}

/// Where progress reports go: a registry record for queued jobs, nowhere for
/// synchronous requests.
#[derive(Debug, Clone)]
pub enum ProgressSink {
    Registry(JobRegistry),
    Detached,
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub tool: Tool,
    pub work_dir: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub input: StoredJobInput,
    pub limits: UploadLimits,
    pub libreoffice_cmd: Option<String>,
    pub command_timeout: Duration,
    pub cancel: CancellationToken,
    pub progress: ProgressSink,
}

impl JobContext {
    pub async fn set_progress(&self, percent: f64, message: impl Into<String>) {
        let progress = clamp_progress(percent);
        let message = message.into();
        info!(job_id = %self.job_id, progress, message = %message, "Job progress update");

        if let ProgressSink::Registry(registry) = &self.progress {
            registry
                .update(&self.job_id, |job| job.record_progress(progress, message))
                .await;
        }
    }

    pub fn log(&self, message: &str) {
        info!(job_id = %self.job_id, tool = %self.tool, "{message}");
    }

    pub fn output_path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(filename)
    }
}

pub fn clamp_progress(percent: f64) -> u8 {
    if percent.is_nan() {
        return 0;
    }
    percent.round().clamp(0.0, 100.0) as u8
}

pub type ProcessFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, ApiError>> + Send>>;

/// Maps a tool to the unit of work that produces its output file.
pub trait Dispatch: Send + Sync {
    fn resolve(&self, slug: &str) -> Option<Tool> {
        Tool::from_slug(slug)
    }

    fn run(&self, tool: Tool, ctx: JobContext) -> ProcessFuture;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolDispatch;

impl Dispatch for ToolDispatch {
    fn run(&self, tool: Tool, ctx: JobContext) -> ProcessFuture {
        Box::pin(run_tool(tool, ctx))
    }
}

async fn run_tool(tool: Tool, ctx: JobContext) -> Result<ToolOutput, ApiError> {
    debug!(
        job_id = %ctx.job_id,
        input_dir = %ctx.input_dir.display(),
        output_dir = %ctx.output_dir.display(),
        "Processor context ready"
    );
    ctx.log(&format!("processor start ({tool})"));
    let output = match tool {
        Tool::MergePdf => pdf::merge_pdf(&ctx).await?,
        Tool::SplitPdf => pdf::split_pdf(&ctx).await?,
        Tool::RotatePdf => pdf::rotate_pdf(&ctx).await?,
        Tool::CompressPdf => external::compress_pdf(&ctx).await?,
        Tool::ProtectPdf => external::protect_pdf(&ctx).await?,
        Tool::UnlockPdf => external::unlock_pdf(&ctx).await?,
        Tool::WordToPdf => {
            external::office_to_pdf(&ctx, &[".doc", ".docx"], "word.pdf").await?
        }
        Tool::PowerpointToPdf => {
            external::office_to_pdf(&ctx, &[".ppt", ".pptx"], "slides.pdf").await?
        }
        Tool::ExcelToPdf => {
            external::office_to_pdf(&ctx, &[".xls", ".xlsx"], "sheet.pdf").await?
        }
        Tool::PdfToJpg => external::pdf_to_jpg(&ctx).await?,
        Tool::JpgToPdf => overlay::jpg_to_pdf(&ctx).await?,
        Tool::Watermark => overlay::watermark(&ctx).await?,
        Tool::EditPdf => overlay::edit_pdf(&ctx).await?,
        Tool::SignPdf => overlay::sign_pdf(&ctx).await?,
        Tool::HtmlToPdf => external::html_to_pdf(&ctx).await?,
        Tool::PdfToWord => external::pdf_to_office(&ctx, &external::WORD_TARGET).await?,
        Tool::PdfToPowerpoint => {
            external::pdf_to_office(&ctx, &external::POWERPOINT_TARGET).await?
        }
        Tool::PdfToExcel => spreadsheet::pdf_to_excel(&ctx).await?,
    };
    ctx.log(&format!("processor done ({tool})"));
    Ok(output)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) use super::pdf::fixtures::{page_count_of, sample_pdf};

    pub fn context(dir: &std::path::Path, tool: Tool, input: StoredJobInput) -> JobContext {
        let output_dir = dir.join("output");
        std::fs::create_dir_all(&output_dir).expect("create output dir");
        JobContext {
            job_id: "test-job".to_string(),
            tool,
            work_dir: dir.to_path_buf(),
            input_dir: dir.join("input"),
            output_dir,
            input,
            limits: UploadLimits::default(),
            libreoffice_cmd: None,
            command_timeout: Duration::from_secs(30),
            cancel: CancellationToken::new(),
            progress: ProgressSink::Detached,
        }
    }
}
