use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tokio::fs;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use super::ToolOutput;
use crate::{
    config::UploadLimits,
    error::ApiError,
    models::{StoredInputFile, StoredJobInput},
};

pub fn get_field<'a>(input: &'a StoredJobInput, key: &str, fallback: &'a str) -> &'a str {
    input
        .fields
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
        .unwrap_or(fallback)
}

pub fn get_boolean_field(input: &StoredJobInput, key: &str) -> bool {
    matches!(
        get_field(input, key, "").trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parses a numeric field, falling back when it is missing, not finite or below `min`.
pub fn get_number_field(input: &StoredJobInput, key: &str, fallback: f32, min: f32) -> f32 {
    match get_field(input, key, "").trim().parse::<f32>() {
        Ok(value) if value.is_finite() && value >= min => value,
        _ => fallback,
    }
}

pub fn get_required_files<'a>(
    input: &'a StoredJobInput,
    key: &str,
    min: usize,
    max: usize,
) -> Result<&'a [StoredInputFile], ApiError> {
    let files = input.files.get(key).map(Vec::as_slice).unwrap_or(&[]);
    if files.len() < min {
        return Err(ApiError::bad_request(format!(
            "Missing required file field \"{key}\"."
        )));
    }
    if files.len() > max {
        return Err(ApiError::bad_request(format!(
            "\"{key}\" supports up to {max} file(s)."
        )));
    }
    Ok(files)
}

pub fn get_required_file<'a>(
    input: &'a StoredJobInput,
    key: &str,
) -> Result<&'a StoredInputFile, ApiError> {
    let files = get_required_files(input, key, 1, 1)?;
    Ok(&files[0])
}

pub fn get_optional_file<'a>(
    input: &'a StoredJobInput,
    key: &str,
) -> Result<Option<&'a StoredInputFile>, ApiError> {
    match input.files.get(key).map(Vec::as_slice).unwrap_or(&[]) {
        [] => Ok(None),
        [file] => Ok(Some(file)),
        _ => Err(ApiError::bad_request(format!("\"{key}\" supports only one file."))),
    }
}

pub fn assert_total_upload_limits(
    input: &StoredJobInput,
    limits: &UploadLimits,
) -> Result<(), ApiError> {
    if input.total_files > limits.max_files {
        return Err(ApiError::bad_request(format!(
            "You can upload up to {} files at once.",
            limits.max_files
        )));
    }
    if input.total_bytes > limits.max_total_bytes() {
        return Err(ApiError::bad_request(format!(
            "Total upload size exceeds {}MB limit.",
            limits.max_total_mb
        )));
    }
    Ok(())
}

pub fn assert_pdf_file(file: &StoredInputFile) -> Result<(), ApiError> {
    let is_pdf = file.original_name.to_ascii_lowercase().ends_with(".pdf")
        || file.content_type == "application/pdf";
    if !is_pdf {
        return Err(ApiError::bad_request(format!(
            "\"{}\" is not a PDF file.",
            file.original_name
        )));
    }
    Ok(())
}

pub fn is_png(file: &StoredInputFile) -> bool {
    file.content_type == "image/png" || file.original_name.to_ascii_lowercase().ends_with(".png")
}

pub fn is_jpeg(file: &StoredInputFile) -> bool {
    let lower = file.original_name.to_ascii_lowercase();
    file.content_type == "image/jpeg" || lower.ends_with(".jpg") || lower.ends_with(".jpeg")
}

pub fn assert_image_file(file: &StoredInputFile) -> Result<(), ApiError> {
    if !is_png(file) && !is_jpeg(file) {
        return Err(ApiError::bad_request(format!(
            "\"{}\" must be JPG or PNG.",
            file.original_name
        )));
    }
    Ok(())
}

pub fn assert_ext(file: &StoredInputFile, allowed: &[&str]) -> Result<(), ApiError> {
    let ext = Path::new(&file.original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    if !allowed.contains(&ext.as_str()) {
        return Err(ApiError::bad_request(format!(
            "\"{}\" must use one of: {}",
            file.original_name,
            allowed.join(", ")
        )));
    }
    Ok(())
}

pub fn assert_page_limit(page_count: usize, limits: &UploadLimits) -> Result<(), ApiError> {
    if page_count > limits.max_pages {
        return Err(ApiError::PayloadTooLarge(format!(
            "PDF has {page_count} pages. Limit is {}.",
            limits.max_pages
        )));
    }
    Ok(())
}

pub fn progress_for_page(page: usize, page_count: usize, start: f64, end: f64) -> f64 {
    if page_count <= 1 {
        return end;
    }
    let ratio = (page.saturating_sub(1)) as f64 / (page_count - 1) as f64;
    (start + (end - start) * ratio).round()
}

/// Accepts a processor result only when it points at a non-empty regular file.
pub async fn done_result(
    output_path: PathBuf,
    filename: &str,
    content_type: &str,
) -> Result<ToolOutput, ApiError> {
    let empty = || ApiError::Internal(format!("Generated output \"{filename}\" is empty."));
    let metadata = fs::metadata(&output_path).await.map_err(|_| empty())?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(empty());
    }
    Ok(ToolOutput {
        output_path,
        filename: filename.to_string(),
        content_type: content_type.to_string(),
    })
}

pub struct ZipEntry {
    pub path: PathBuf,
    pub name: String,
}

pub async fn zip_file_entries(output_path: PathBuf, entries: Vec<ZipEntry>) -> Result<(), ApiError> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let file = File::create(&output_path)
            .with_context(|| format!("Failed to create {}", output_path.display()))?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(9));

        for entry in &entries {
            writer
                .start_file(entry.name.as_str(), options)
                .with_context(|| format!("Failed to add {} to archive", entry.name))?;
            let mut source = File::open(&entry.path)
                .with_context(|| format!("Failed to open {}", entry.path.display()))?;
            io::copy(&mut source, &mut writer)?;
        }
        writer.finish().context("Failed to finalize archive")?;
        Ok(())
    })
    .await
    .context("Archive task panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(name: &str, content_type: &str) -> StoredInputFile {
        StoredInputFile {
            field: "file".to_string(),
            original_name: name.to_string(),
            content_type: content_type.to_string(),
            size: 1,
            path: PathBuf::from(name),
        }
    }

    #[test]
    fn pdf_detection_uses_name_or_content_type() {
        assert!(assert_pdf_file(&stored("a.PDF", "application/octet-stream")).is_ok());
        assert!(assert_pdf_file(&stored("scan", "application/pdf")).is_ok());
        assert!(assert_pdf_file(&stored("notes.txt", "text/plain")).is_err());
    }

    #[test]
    fn extension_allow_list_is_case_insensitive() {
        assert!(assert_ext(&stored("Deck.PPTX", ""), &[".ppt", ".pptx"]).is_ok());
        let err = assert_ext(&stored("deck.key", ""), &[".ppt", ".pptx"]).expect_err("reject");
        assert!(err.to_string().contains(".ppt, .pptx"));
    }

    #[test]
    fn images_are_recognised_by_name_or_type() {
        assert!(assert_image_file(&stored("sig.PNG", "")).is_ok());
        assert!(assert_image_file(&stored("scan", "image/jpeg")).is_ok());
        let err = assert_image_file(&stored("sig.gif", "image/gif")).expect_err("gif");
        assert_eq!(err.to_string(), "\"sig.gif\" must be JPG or PNG.");
    }

    #[test]
    fn numeric_and_boolean_fields_fall_back_on_garbage() {
        let mut input = StoredJobInput::default();
        for (key, value) in [("opacity", "0.5"), ("scale", "-1"), ("size", "abc"), ("ocr", "Yes")] {
            input.fields.insert(key.to_string(), vec![value.to_string()]);
        }
        assert_eq!(get_number_field(&input, "opacity", 0.3, 0.0), 0.5);
        assert_eq!(get_number_field(&input, "scale", 0.35, 0.0), 0.35);
        assert_eq!(get_number_field(&input, "size", 18.0, 1.0), 18.0);
        assert_eq!(get_number_field(&input, "missing", 7.0, 0.0), 7.0);
        assert!(get_boolean_field(&input, "ocr"));
        assert!(!get_boolean_field(&input, "missing"));
    }

    #[test]
    fn optional_files_allow_at_most_one() {
        let mut input = StoredJobInput::default();
        assert!(get_optional_file(&input, "image").expect("none").is_none());
        input.files.insert("image".to_string(), vec![stored("a.png", "")]);
        assert!(get_optional_file(&input, "image").expect("one").is_some());
        input
            .files
            .insert("image".to_string(), vec![stored("a.png", ""), stored("b.png", "")]);
        assert!(get_optional_file(&input, "image").is_err());
    }

    #[test]
    fn required_files_respect_bounds() {
        let mut input = StoredJobInput::default();
        assert!(get_required_files(&input, "files", 1, 5).is_err());
        input
            .files
            .insert("files".to_string(), vec![stored("a.pdf", ""), stored("b.pdf", "")]);
        assert_eq!(get_required_files(&input, "files", 1, 5).expect("files").len(), 2);
        assert!(get_required_file(&input, "files").is_err());
    }

    #[test]
    fn page_progress_interpolates() {
        assert_eq!(progress_for_page(1, 1, 10.0, 80.0), 80.0);
        assert_eq!(progress_for_page(1, 3, 10.0, 80.0), 10.0);
        assert_eq!(progress_for_page(2, 3, 10.0, 80.0), 45.0);
        assert_eq!(progress_for_page(3, 3, 10.0, 80.0), 80.0);
    }

    #[tokio::test]
    async fn empty_output_is_not_a_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.pdf");
        std::fs::write(&path, b"").expect("write");
        let err = done_result(path.clone(), "out.pdf", "application/pdf")
            .await
            .expect_err("empty");
        assert_eq!(err.to_string(), "Generated output \"out.pdf\" is empty.");

        let missing = done_result(dir.path().join("nope.pdf"), "nope.pdf", "application/pdf").await;
        assert!(missing.is_err());

        std::fs::write(&path, b"%PDF").expect("write");
        assert!(done_result(path, "out.pdf", "application/pdf").await.is_ok());
    }
}
