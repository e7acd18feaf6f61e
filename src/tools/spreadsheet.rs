use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tokio::fs;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use super::{
    command::run_command,
    common::{done_result, get_boolean_field, progress_for_page},
    external::checked_pdf_input,
    pdf::{blocking, load_pdf},
    JobContext, ToolOutput,
};
use crate::error::ApiError;

/// Pages beyond this count skip OCR in a single job.
const OCR_MAX_PAGES: usize = 20;
const OCR_DPI: u32 = 200;
/// Excel refuses cells longer than this.
const CELL_MAX_CHARS: usize = 32_767;

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const CONTENT_TYPES_HEAD: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0" applyAlignment="1"><alignment vertical="top" wrapText="1"/></xf></cellXfs></styleSheet>"#;

#[derive(Debug, Clone, Copy)]
struct OcrBudget {
    requested: bool,
    available: bool,
    used: usize,
}

impl OcrBudget {
    fn can_run(&self) -> bool {
        self.requested && self.available && self.used < OCR_MAX_PAGES
    }

    /// What a page without any text says, depending on why OCR did not fill it.
    fn empty_page_note(&self) -> String {
        if self.requested && !self.available {
            "OCR unavailable in this runtime. No text layer found for this page.".to_string()
        } else if self.requested && self.used >= OCR_MAX_PAGES {
            format!("No text layer found. OCR page limit ({OCR_MAX_PAGES}) reached.")
        } else {
            "No text layer found on this page.".to_string()
        }
    }
}

async fn tesseract_available(ctx: &JobContext) -> bool {
    run_command("tesseract", ["--version"], None, ctx.command_timeout, &ctx.cancel)
        .await
        .is_ok()
}

async fn ocr_page(ctx: &JobContext, pdf: &Path, page: usize, image_dir: &Path) -> Result<String, ApiError> {
    let prefix = image_dir.join(format!("page-{page}"));
    let args = [
        "-f".to_string(),
        page.to_string(),
        "-l".to_string(),
        page.to_string(),
        "-singlefile".to_string(),
        "-r".to_string(),
        OCR_DPI.to_string(),
        "-png".to_string(),
        pdf.display().to_string(),
        prefix.display().to_string(),
    ];
    run_command("pdftoppm", args, None, ctx.command_timeout, &ctx.cancel).await?;

    let image = image_dir.join(format!("page-{page}.png"));
    let text_base = ctx.work_dir.join(format!("ocr-excel-page-{page}"));
    let recognised = run_command(
        "tesseract",
        [
            image.display().to_string(),
            text_base.display().to_string(),
            "-l".to_string(),
            "eng".to_string(),
        ],
        None,
        ctx.command_timeout,
        &ctx.cancel,
    )
    .await;
    let _ = fs::remove_file(&image).await;
    recognised?;

    let text_path = text_base.with_extension("txt");
    let text = fs::read_to_string(&text_path)
        .await
        .with_context(|| format!("Failed to read {}", text_path.display()))?;
    Ok(text.trim().to_string())
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars().take(CELL_MAX_CHARS) {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\t' | '\n' | '\r' => escaped.push(c),
            c if c.is_control() => {}
            c => escaped.push(c),
        }
    }
    escaped
}

fn sheet_xml(text: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            "\n",
            r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
            r#"<cols><col min="1" max="1" width="120" customWidth="1"/></cols>"#,
            r#"<sheetData><row r="1"><c r="A1" t="inlineStr" s="1"><is><t xml:space="preserve">{}</t></is></c></row></sheetData>"#,
            "</worksheet>"
        ),
        escape_xml(text)
    )
}

/// Writes a workbook with one `page-N` worksheet per entry, text in A1.
fn write_workbook(path: &Path, pages: &[String]) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut content_types = CONTENT_TYPES_HEAD.to_string();
    let mut sheets = String::new();
    let mut relationships = String::new();
    for index in 1..=pages.len() {
        content_types.push_str(&format!(
            r#"<Override PartName="/xl/worksheets/sheet{index}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
        ));
        sheets.push_str(&format!(
            r#"<sheet name="page-{index}" sheetId="{index}" r:id="rId{index}"/>"#
        ));
        relationships.push_str(&format!(
            r#"<Relationship Id="rId{index}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{index}.xml"/>"#
        ));
    }
    content_types.push_str("</Types>");
    let styles_id = pages.len() + 1;
    relationships.push_str(&format!(
        r#"<Relationship Id="rId{styles_id}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#
    ));

    let workbook = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{sheets}</sheets></workbook>"#
    );
    let workbook_rels = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{relationships}</Relationships>"#
    );

    let mut parts: Vec<(String, String)> = vec![
        ("[Content_Types].xml".to_string(), content_types),
        ("_rels/.rels".to_string(), ROOT_RELS.to_string()),
        ("xl/workbook.xml".to_string(), workbook),
        ("xl/_rels/workbook.xml.rels".to_string(), workbook_rels),
        ("xl/styles.xml".to_string(), STYLES.to_string()),
    ];
    for (index, text) in pages.iter().enumerate() {
        parts.push((format!("xl/worksheets/sheet{}.xml", index + 1), sheet_xml(text)));
    }

    for (name, body) in parts {
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("Failed to add {name} to workbook"))?;
        writer.write_all(body.as_bytes())?;
    }
    writer.finish().context("Failed to finalize workbook")?;
    Ok(())
}

pub async fn pdf_to_excel(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    let (file, page_count) = checked_pdf_input(ctx).await?;
    let requested = get_boolean_field(&ctx.input, "includeOcr");
    let mut ocr = OcrBudget {
        requested,
        available: requested && tesseract_available(ctx).await,
        used: 0,
    };

    ctx.set_progress(5.0, "Reading text layer...").await;
    let source = file.clone();
    let mut texts = blocking(move || {
        let doc = load_pdf(&source)?;
        Ok((1..=page_count as u32)
            .map(|page| {
                doc.extract_text(&[page])
                    .map(|text| text.trim().to_string())
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>())
    })
    .await?;

    let image_dir = ctx.work_dir.join("excel-images");
    if ocr.can_run() {
        fs::create_dir_all(&image_dir)
            .await
            .with_context(|| format!("Failed to create {}", image_dir.display()))?;
    }

    for (index, text) in texts.iter_mut().enumerate() {
        let page = index + 1;
        ctx.set_progress(
            progress_for_page(page, page_count, 10.0, 90.0),
            format!("Processing page {page}/{page_count}..."),
        )
        .await;

        if text.is_empty() && ocr.can_run() {
            ocr.used += 1;
            *text = ocr_page(ctx, &file.path, page, &image_dir).await?;
        }
        if text.is_empty() {
            *text = ocr.empty_page_note();
        }
    }
    if ocr.requested && ocr.used >= OCR_MAX_PAGES {
        ctx.log(&format!(
            "OCR page limit reached ({OCR_MAX_PAGES}); remaining pages skip OCR."
        ));
    }

    let output_path: PathBuf = ctx.output_path("output.xlsx");
    let target = output_path.clone();
    blocking(move || Ok(write_workbook(&target, &texts)?)).await?;
    done_result(output_path, "output.xlsx", XLSX_CONTENT_TYPE).await
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::{
        models::{StoredInputFile, StoredJobInput},
        tools::{
            testing::{context, sample_pdf},
            Tool,
        },
    };

    fn read_entry(archive: &mut zip::ZipArchive<File>, name: &str) -> String {
        let mut body = String::new();
        archive
            .by_name(name)
            .expect("workbook part")
            .read_to_string(&mut body)
            .expect("read part");
        body
    }

    #[test]
    fn cell_text_is_escaped_and_stripped_of_control_characters() {
        assert_eq!(escape_xml("a<b & \"c\"\u{7}\n"), "a&lt;b &amp; &quot;c&quot;\n");
        assert_eq!(escape_xml(&"x".repeat(CELL_MAX_CHARS + 10)).len(), CELL_MAX_CHARS);
    }

    #[test]
    fn empty_page_notes_explain_missing_ocr() {
        let mut budget = OcrBudget {
            requested: false,
            available: false,
            used: 0,
        };
        assert_eq!(budget.empty_page_note(), "No text layer found on this page.");
        budget.requested = true;
        assert!(budget.empty_page_note().starts_with("OCR unavailable"));
        budget.available = true;
        budget.used = OCR_MAX_PAGES;
        assert!(!budget.can_run());
        assert_eq!(
            budget.empty_page_note(),
            format!("No text layer found. OCR page limit ({OCR_MAX_PAGES}) reached.")
        );
    }

    #[test]
    fn workbook_has_one_sheet_per_page() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.xlsx");
        write_workbook(&path, &["first".to_string(), "R&D".to_string()]).expect("workbook");

        let mut archive = zip::ZipArchive::new(File::open(&path).expect("open")).expect("zip");
        let workbook = read_entry(&mut archive, "xl/workbook.xml");
        assert!(workbook.contains(r#"name="page-1""#));
        assert!(workbook.contains(r#"name="page-2""#));
        assert!(read_entry(&mut archive, "xl/worksheets/sheet2.xml").contains("R&amp;D"));
        assert!(read_entry(&mut archive, "[Content_Types].xml").contains("sheet2.xml"));
    }

    #[tokio::test]
    async fn pages_without_text_get_a_note() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input_dir = dir.path().join("input");
        std::fs::create_dir_all(&input_dir).expect("input dir");
        let bytes = sample_pdf(2);
        let path = input_dir.join("000-scan.pdf");
        std::fs::write(&path, &bytes).expect("write pdf");

        let mut input = StoredJobInput {
            total_files: 1,
            total_bytes: bytes.len() as u64,
            ..StoredJobInput::default()
        };
        input.files.insert(
            "file".to_string(),
            vec![StoredInputFile {
                field: "file".to_string(),
                original_name: "scan.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                size: bytes.len() as u64,
                path,
            }],
        );
        let ctx = context(dir.path(), Tool::PdfToExcel, input);

        let output = pdf_to_excel(&ctx).await.expect("pdf to excel");
        assert_eq!(output.filename, "output.xlsx");
        assert_eq!(output.content_type, XLSX_CONTENT_TYPE);
        let mut archive =
            zip::ZipArchive::new(File::open(&output.output_path).expect("open")).expect("zip");
        let sheet = read_entry(&mut archive, "xl/worksheets/sheet2.xml");
        assert!(sheet.contains("No text layer found on this page."));
    }
}
