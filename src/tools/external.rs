use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;

use super::{
    command::run_command,
    common::{
        assert_ext, assert_page_limit, assert_pdf_file, assert_total_upload_limits, done_result,
        get_boolean_field, get_field, get_required_file, progress_for_page, zip_file_entries,
        ZipEntry,
    },
    pdf::count_pages,
    JobContext, ToolOutput,
};
use crate::{error::ApiError, models::StoredInputFile};

const HTML_MAX_BYTES: usize = 2 * 1024 * 1024;

pub(super) async fn checked_pdf_input(ctx: &JobContext) -> Result<(StoredInputFile, usize), ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?.clone();
    assert_pdf_file(&file)?;
    let pages = count_pages(file.path.clone(), file.original_name.clone()).await?;
    assert_page_limit(pages, &ctx.limits)?;
    Ok((file, pages))
}

fn with_hint(err: ApiError, hint: &str) -> ApiError {
    match err {
        ApiError::Unavailable(message) => ApiError::Unavailable(format!("{message} {hint}")),
        other => other,
    }
}

pub async fn compress_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    let (file, _) = checked_pdf_input(ctx).await?;
    let quality = match get_field(&ctx.input, "quality", "ebook") {
        "screen" => "/screen",
        "printer" => "/printer",
        _ => "/ebook",
    };

    ctx.set_progress(20.0, "Compressing with Ghostscript...").await;
    let output_path = ctx.output_path("compressed.pdf");
    run_command(
        "gs",
        [
            "-sDEVICE=pdfwrite".to_string(),
            "-dCompatibilityLevel=1.4".to_string(),
            "-dNOPAUSE".to_string(),
            "-dQUIET".to_string(),
            "-dBATCH".to_string(),
            format!("-dPDFSETTINGS={quality}"),
            format!("-sOutputFile={}", output_path.display()),
            file.path.display().to_string(),
        ],
        None,
        ctx.command_timeout,
        &ctx.cancel,
    )
    .await
    .map_err(|err| with_hint(err, "Compress requires ghostscript."))?;

    done_result(output_path, "compressed.pdf", "application/pdf").await
}

pub async fn protect_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?;
    assert_pdf_file(file)?;
    let password = get_field(&ctx.input, "password", "");
    if password.chars().count() < 4 {
        return Err(ApiError::bad_request("Password must be at least 4 characters."));
    }

    let output_path = ctx.output_path("protected.pdf");
    let input_path = file.path.display().to_string();
    let target = output_path.display().to_string();
    run_command(
        "qpdf",
        [
            "--encrypt",
            password,
            password,
            "256",
            "--",
            input_path.as_str(),
            target.as_str(),
        ],
        None,
        ctx.command_timeout,
        &ctx.cancel,
    )
    .await
    .map_err(|err| with_hint(err, "Protect PDF requires qpdf."))?;

    done_result(output_path, "protected.pdf", "application/pdf").await
}

pub async fn unlock_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?;
    assert_pdf_file(file)?;
    let password = get_field(&ctx.input, "password", "");
    if password.is_empty() {
        return Err(ApiError::bad_request("Password is required to unlock PDF."));
    }

    let output_path = ctx.output_path("unlocked.pdf");
    let args = [
        format!("--password={password}"),
        "--decrypt".to_string(),
        file.path.display().to_string(),
        output_path.display().to_string(),
    ];
    match run_command("qpdf", args, None, ctx.command_timeout, &ctx.cancel).await {
        Ok(_) => {}
        Err(ApiError::BadRequest(_)) => {
            return Err(ApiError::bad_request(
                "Failed to unlock PDF. Password may be incorrect.",
            ));
        }
        Err(err) => return Err(with_hint(err, "Unlock PDF requires qpdf.")),
    }

    done_result(output_path, "unlocked.pdf", "application/pdf").await
}

/// One LibreOffice headless conversion of `input` into `ctx.output_dir`.
struct Conversion<'a> {
    input: &'a Path,
    convert_to: &'a str,
    infilter: Option<&'a str>,
}

async fn run_libreoffice(ctx: &JobContext, conversion: Conversion<'_>) -> Result<(), ApiError> {
    let mut args = vec![
        format!("-env:UserInstallation=file://{}", ctx.work_dir.join("lo-profile").display()),
        "--headless".to_string(),
        "--norestore".to_string(),
        "--nolockcheck".to_string(),
        "--nodefault".to_string(),
        "--nofirststartwizard".to_string(),
    ];
    if let Some(filter) = conversion.infilter {
        args.push(format!("--infilter={filter}"));
    }
    args.extend([
        "--convert-to".to_string(),
        conversion.convert_to.to_string(),
        "--outdir".to_string(),
        ctx.output_dir.display().to_string(),
        conversion.input.display().to_string(),
    ]);

    let candidates = ctx
        .libreoffice_cmd
        .iter()
        .map(String::as_str)
        .chain(["libreoffice", "soffice"]);

    let mut last_error = None;
    for program in candidates {
        match run_command(program, &args, None, ctx.command_timeout, &ctx.cancel).await {
            Ok(_) => return Ok(()),
            Err(ApiError::Unavailable(message)) => {
                ctx.log(&format!("{message} Trying next LibreOffice candidate."));
                last_error = Some(message);
            }
            Err(err) => return Err(err),
        }
    }

    Err(ApiError::Unavailable(format!(
        "LibreOffice command not found. Install LibreOffice and add it to PATH, or set LIBREOFFICE_CMD.{}",
        last_error.map(|m| format!(" Last error: {m}")).unwrap_or_default()
    )))
}

/// LibreOffice names its output after the input stem; move it to `final_name`.
async fn claim_converted(
    ctx: &JobContext,
    input: &Path,
    extension: &str,
    final_name: &str,
) -> Result<PathBuf, ApiError> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let converted = ctx.output_dir.join(format!("{stem}.{extension}"));
    if fs::metadata(&converted).await.is_err() {
        return Err(ApiError::Internal(format!(
            "LibreOffice did not produce \"{final_name}\"."
        )));
    }
    let final_path = ctx.output_path(final_name);
    fs::rename(&converted, &final_path)
        .await
        .with_context(|| format!("Failed to move {}", converted.display()))?;
    Ok(final_path)
}

pub async fn office_to_pdf(
    ctx: &JobContext,
    extensions: &[&str],
    output_filename: &str,
) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?.clone();
    assert_ext(&file, extensions)?;

    ctx.set_progress(15.0, "Converting with LibreOffice...").await;
    run_libreoffice(
        ctx,
        Conversion {
            input: &file.path,
            convert_to: "pdf",
            infilter: None,
        },
    )
    .await?;

    let final_path = claim_converted(ctx, &file.path, "pdf", output_filename).await?;
    let pages = count_pages(final_path.clone(), output_filename.to_string()).await?;
    assert_page_limit(pages, &ctx.limits)?;

    ctx.set_progress(90.0, "Finalizing PDF...").await;
    done_result(final_path, output_filename, "application/pdf").await
}

/// Target of a PDF import through LibreOffice's Draw/Writer/Impress filters.
pub struct OfficeTarget {
    pub infilter: &'static str,
    pub convert_to: &'static str,
    pub extension: &'static str,
    pub filename: &'static str,
    pub content_type: &'static str,
}

pub const WORD_TARGET: OfficeTarget = OfficeTarget {
    infilter: "writer_pdf_import",
    convert_to: "docx:MS Word 2007 XML",
    extension: "docx",
    filename: "output.docx",
    content_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
};

pub const POWERPOINT_TARGET: OfficeTarget = OfficeTarget {
    infilter: "impress_pdf_import",
    convert_to: "pptx:Impress MS PowerPoint 2007 XML",
    extension: "pptx",
    filename: "output.pptx",
    content_type: "application/vnd.openxmlformats-officedocument.presentationml.presentation",
};

pub async fn pdf_to_office(ctx: &JobContext, target: &OfficeTarget) -> Result<ToolOutput, ApiError> {
    let (file, _) = checked_pdf_input(ctx).await?;
    if get_boolean_field(&ctx.input, "includeOcr") {
        ctx.log("OCR is not applied to LibreOffice PDF imports; converting the text layer only.");
    }

    ctx.set_progress(15.0, "Converting with LibreOffice...").await;
    run_libreoffice(
        ctx,
        Conversion {
            input: &file.path,
            convert_to: target.convert_to,
            infilter: Some(target.infilter),
        },
    )
    .await?;

    ctx.set_progress(90.0, "Finalizing document...").await;
    let final_path = claim_converted(ctx, &file.path, target.extension, target.filename).await?;
    done_result(final_path, target.filename, target.content_type).await
}

pub async fn html_to_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    let mode = get_field(&ctx.input, "mode", "url");
    let url = get_field(&ctx.input, "url", "").trim();
    let html = get_field(&ctx.input, "html", "").trim();

    match mode {
        "url" if url.is_empty() => {
            return Err(ApiError::bad_request("URL is required for URL mode."));
        }
        "url" => {
            return Err(ApiError::Unavailable(
                "Fetching remote pages is not available in this runtime. Submit the page source with mode \"html\"."
                    .to_string(),
            ));
        }
        "html" if html.is_empty() => {
            return Err(ApiError::bad_request("HTML content is required for HTML mode."));
        }
        "html" => {}
        _ => return Err(ApiError::bad_request("Mode must be \"url\" or \"html\".")),
    }
    if html.len() > HTML_MAX_BYTES {
        return Err(ApiError::PayloadTooLarge(format!(
            "HTML content is too large. Max is {}KB.",
            HTML_MAX_BYTES / 1024
        )));
    }

    ctx.set_progress(10.0, "Rendering HTML...").await;
    let source = ctx.input_dir.join("page.html");
    fs::write(&source, html)
        .await
        .with_context(|| format!("Failed to write {}", source.display()))?;

    run_libreoffice(
        ctx,
        Conversion {
            input: &source,
            convert_to: "pdf:writer_web_pdf_Export",
            infilter: None,
        },
    )
    .await?;

    ctx.set_progress(80.0, "Generating PDF...").await;
    let final_path = claim_converted(ctx, &source, "pdf", "html.pdf").await?;
    let pages = count_pages(final_path.clone(), "html.pdf".to_string()).await?;
    assert_page_limit(pages, &ctx.limits)?;
    done_result(final_path, "html.pdf", "application/pdf").await
}

pub async fn pdf_to_jpg(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    let (file, page_count) = checked_pdf_input(ctx).await?;
    let dpi = match get_field(&ctx.input, "dpi", "150").trim() {
        "300" => 300,
        _ => 150,
    };

    let image_dir = ctx.output_dir.join("images");
    fs::create_dir_all(&image_dir)
        .await
        .with_context(|| format!("Failed to create {}", image_dir.display()))?;

    let mut entries = Vec::with_capacity(page_count);
    for page in 1..=page_count {
        ctx.set_progress(
            progress_for_page(page, page_count, 10.0, 80.0),
            format!("Rendering page {page}/{page_count}..."),
        )
        .await;

        let prefix = image_dir.join(format!("page-{page}"));
        let args = [
            "-f".to_string(),
            page.to_string(),
            "-l".to_string(),
            page.to_string(),
            "-singlefile".to_string(),
            "-r".to_string(),
            dpi.to_string(),
            "-jpeg".to_string(),
            file.path.display().to_string(),
            prefix.display().to_string(),
        ];
        run_command("pdftoppm", args, None, ctx.command_timeout, &ctx.cancel)
            .await
            .map_err(|err| with_hint(err, "PDF to JPG requires poppler-utils."))?;

        let rendered = image_dir.join(format!("page-{page}.jpg"));
        if fs::metadata(&rendered).await.is_err() {
            return Err(ApiError::Internal(format!("Failed to render page {page}.")));
        }
        entries.push(ZipEntry {
            path: rendered,
            name: format!("page-{page}.jpg"),
        });
    }

    if let [only] = entries.as_slice() {
        let output_path = ctx.output_path("page-1.jpg");
        fs::copy(&only.path, &output_path)
            .await
            .with_context(|| format!("Failed to copy {}", only.path.display()))?;
        return done_result(output_path, "page-1.jpg", "image/jpeg").await;
    }

    let output_path = ctx.output_path("pages.zip");
    zip_file_entries(output_path.clone(), entries).await?;
    done_result(output_path, "pages.zip", "application/zip").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::StoredJobInput,
        tools::{testing::context, Tool},
    };

    fn input(name: &str, fields: &[(&str, &str)]) -> StoredJobInput {
        let mut input = StoredJobInput {
            total_files: 1,
            total_bytes: 4,
            ..StoredJobInput::default()
        };
        input.files.insert(
            "file".to_string(),
            vec![StoredInputFile {
                field: "file".to_string(),
                original_name: name.to_string(),
                content_type: String::new(),
                size: 4,
                path: std::path::PathBuf::from(format!("/nonexistent/{name}")),
            }],
        );
        for (key, value) in fields {
            input.fields.insert(key.to_string(), vec![value.to_string()]);
        }
        input
    }

    #[tokio::test]
    async fn protect_requires_a_reasonable_password() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), Tool::ProtectPdf, input("doc.pdf", &[("password", "abc")]));
        let err = protect_pdf(&ctx).await.expect_err("short password");
        assert_eq!(err.to_string(), "Password must be at least 4 characters.");
    }

    #[tokio::test]
    async fn unlock_requires_a_password() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), Tool::UnlockPdf, input("doc.pdf", &[]));
        let err = unlock_pdf(&ctx).await.expect_err("missing password");
        assert_eq!(err.to_string(), "Password is required to unlock PDF.");
    }

    #[tokio::test]
    async fn office_conversion_checks_the_extension_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), Tool::WordToPdf, input("sheet.xlsx", &[]));
        let err = office_to_pdf(&ctx, &[".doc", ".docx"], "word.pdf")
            .await
            .expect_err("wrong extension");
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn html_conversion_validates_its_mode_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cases = [
            (vec![("mode", "pdf")], "Mode must be \"url\" or \"html\"."),
            (vec![], "URL is required for URL mode."),
            (vec![("mode", "html"), ("html", "   ")], "HTML content is required for HTML mode."),
        ];
        for (fields, message) in cases {
            let mut input = StoredJobInput::default();
            for (key, value) in fields {
                input.fields.insert(key.to_string(), vec![value.to_string()]);
            }
            let ctx = context(dir.path(), Tool::HtmlToPdf, input);
            let err = html_to_pdf(&ctx).await.expect_err("invalid html request");
            assert_eq!(err.to_string(), message);
        }

        let mut input = StoredJobInput::default();
        input
            .fields
            .insert("url".to_string(), vec!["https://example.com".to_string()]);
        let ctx = context(dir.path(), Tool::HtmlToPdf, input);
        let err = html_to_pdf(&ctx).await.expect_err("remote fetch");
        assert!(matches!(err, ApiError::Unavailable(_)));
    }

    #[tokio::test]
    async fn oversized_html_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut input = StoredJobInput::default();
        input.fields.insert("mode".to_string(), vec!["html".to_string()]);
        input
            .fields
            .insert("html".to_string(), vec!["x".repeat(HTML_MAX_BYTES + 1)]);
        let ctx = context(dir.path(), Tool::HtmlToPdf, input);
        let err = html_to_pdf(&ctx).await.expect_err("too large");
        assert!(matches!(err, ApiError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn pdf_imports_reject_non_pdf_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), Tool::PdfToWord, input("notes.txt", &[]));
        let err = pdf_to_office(&ctx, &WORD_TARGET).await.expect_err("not a pdf");
        assert_eq!(err.to_string(), "\"notes.txt\" is not a PDF file.");
    }

    #[tokio::test]
    async fn unreadable_pdf_is_rejected_before_any_binary_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), Tool::CompressPdf, input("doc.pdf", &[]));
        let err = compress_pdf(&ctx).await.expect_err("invalid pdf");
        assert_eq!(err.to_string(), "\"doc.pdf\" is not a valid PDF file.");
    }
}
