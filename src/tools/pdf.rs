use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use tokio::fs;

use super::{
    common::{
        assert_page_limit, assert_pdf_file, assert_total_upload_limits, done_result, get_field,
        get_required_file, get_required_files, zip_file_entries, ZipEntry,
    },
    pages::{parse_page_selection, parse_split_groups},
    JobContext, ToolOutput,
};
use crate::{error::ApiError, models::StoredInputFile};

const INHERITABLE_KEYS: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

pub(super) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("PDF worker task panicked")?
}

pub(super) fn load_pdf(file: &StoredInputFile) -> Result<Document, ApiError> {
    load_pdf_at(&file.path, &file.original_name)
}

fn load_pdf_at(path: &Path, display_name: &str) -> Result<Document, ApiError> {
    Document::load(path).map_err(|_| {
        ApiError::bad_request(format!("\"{display_name}\" is not a valid PDF file."))
    })
}

pub(super) fn save_pdf(doc: &mut Document, path: &Path) -> Result<(), ApiError> {
    doc.save(path)
        .map_err(|e| anyhow!("Failed to write {}: {e}", path.display()))?;
    Ok(())
}

pub async fn count_pages(path: PathBuf, display_name: String) -> Result<usize, ApiError> {
    blocking(move || Ok(load_pdf_at(&path, &display_name)?.get_pages().len())).await
}

fn type_name(object: &Object) -> Option<&[u8]> {
    let dict = match object {
        Object::Dictionary(dict) => dict,
        Object::Stream(stream) => &stream.dict,
        _ => return None,
    };
    match dict.get(b"Type") {
        Ok(Object::Name(name)) => Some(name.as_slice()),
        _ => None,
    }
}

/// Copies attributes a page inherits from its page-tree ancestors onto the page itself.
pub(super) fn flatten_inherited(doc: &Document, page: &mut Dictionary) {
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    let mut depth = 0;
    while let Some(parent_id) = parent {
        depth += 1;
        if depth > 32 {
            break;
        }
        let Ok(node) = doc.get_dictionary(parent_id) else {
            break;
        };
        for key in INHERITABLE_KEYS {
            if !page.has(key) {
                if let Ok(value) = node.get(key) {
                    page.set(key.to_vec(), value.clone());
                }
            }
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
}

fn merge_documents(documents: Vec<Document>) -> anyhow::Result<Document> {
    let mut next_id = 1;
    let mut pages: Vec<(ObjectId, Dictionary)> = Vec::new();
    let mut objects = Vec::new();

    for mut doc in documents {
        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;

        for page_id in doc.get_pages().into_values() {
            let mut page = doc
                .get_dictionary(page_id)
                .map_err(|e| anyhow!("Page {page_id:?} is not a dictionary: {e}"))?
                .clone();
            flatten_inherited(&doc, &mut page);
            pages.push((page_id, page));
        }
        objects.extend(doc.objects);
    }

    let mut merged = Document::with_version("1.5");
    merged.max_id = next_id;
    for (id, object) in objects {
        if matches!(
            type_name(&object),
            Some(b"Catalog" | b"Pages" | b"Page" | b"Outlines" | b"Outline")
        ) {
            continue;
        }
        merged.objects.insert(id, object);
    }

    let pages_id = merged.new_object_id();
    let mut kids = Vec::with_capacity(pages.len());
    for (page_id, mut page) in pages {
        page.set("Parent", pages_id);
        merged.objects.insert(page_id, Object::Dictionary(page));
        kids.push(Object::Reference(page_id));
    }
    let count = kids.len() as i64;
    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Count" => count,
            "Kids" => kids,
        }),
    );
    let catalog_id = merged.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    merged.trailer.set("Root", catalog_id);
    merged.compress();
    Ok(merged)
}

pub async fn merge_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let files = get_required_files(&ctx.input, "files", 1, 5)?;
    for file in files {
        assert_pdf_file(file)?;
    }

    ctx.set_progress(5.0, "Loading source PDFs...").await;
    let mut documents = Vec::with_capacity(files.len());
    let mut total_pages = 0;
    for (index, file) in files.iter().enumerate() {
        let file = file.clone();
        let doc = blocking(move || load_pdf(&file)).await?;
        total_pages += doc.get_pages().len();
        assert_page_limit(total_pages, &ctx.limits)?;
        documents.push(doc);
        ctx.set_progress(
            ((index + 1) as f64 / files.len() as f64) * 90.0,
            format!("Merged {}/{} file(s)...", index + 1, files.len()),
        )
        .await;
    }

    let output_path = ctx.output_path("merged.pdf");
    let target = output_path.clone();
    blocking(move || {
        let mut merged = merge_documents(documents)?;
        save_pdf(&mut merged, &target)
    })
    .await?;
    done_result(output_path, "merged.pdf", "application/pdf").await
}

pub async fn split_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?.clone();
    assert_pdf_file(&file)?;

    ctx.set_progress(5.0, "Loading PDF...").await;
    let source = blocking(move || load_pdf(&file)).await?;
    let page_count = source.get_pages().len();
    assert_page_limit(page_count, &ctx.limits)?;

    let groups = parse_split_groups(get_field(&ctx.input, "ranges", ""), page_count)?;
    if groups.len() > ctx.limits.max_files * 10 {
        return Err(ApiError::bad_request("Too many split segments requested."));
    }

    let segment_dir = ctx.output_dir.join("segments");
    fs::create_dir_all(&segment_dir)
        .await
        .with_context(|| format!("Failed to create {}", segment_dir.display()))?;

    let mut entries = Vec::with_capacity(groups.len());
    for (index, group) in groups.iter().enumerate() {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let label = if first == last {
            format!("{}", first + 1)
        } else {
            format!("{}-{}", first + 1, last + 1)
        };
        let filename = format!("split-{}-{label}.pdf", index + 1);
        let segment_path = segment_dir.join(&filename);

        let keep: BTreeSet<u32> = group.iter().map(|page| *page as u32 + 1).collect();
        let mut part = source.clone();
        let target = segment_path.clone();
        blocking(move || {
            let remove: Vec<u32> = (1..=page_count as u32).filter(|p| !keep.contains(p)).collect();
            part.delete_pages(&remove);
            part.prune_objects();
            save_pdf(&mut part, &target)
        })
        .await?;

        entries.push(ZipEntry {
            path: segment_path,
            name: filename,
        });
        ctx.set_progress(
            ((index + 1) as f64 / groups.len() as f64) * 90.0,
            format!("Prepared split {}/{}...", index + 1, groups.len()),
        )
        .await;
    }

    let output_path = ctx.output_path("split.zip");
    zip_file_entries(output_path.clone(), entries).await?;
    done_result(output_path, "split.zip", "application/zip").await
}

pub async fn rotate_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?.clone();
    assert_pdf_file(&file)?;

    let angle = get_field(&ctx.input, "angle", "90").trim().parse::<i64>().unwrap_or(0);
    if !matches!(angle, 90 | 180 | 270) {
        return Err(ApiError::bad_request("Angle must be 90, 180, or 270."));
    }

    let mut doc = blocking(move || load_pdf(&file)).await?;
    let pages = doc.get_pages();
    assert_page_limit(pages.len(), &ctx.limits)?;
    let selected = parse_page_selection(get_field(&ctx.input, "pages", "all"), pages.len())?;

    ctx.set_progress(40.0, format!("Rotating {} page(s)...", selected.len())).await;
    let output_path = ctx.output_path("rotated.pdf");
    let target = output_path.clone();
    blocking(move || {
        for index in selected {
            let Some(page_id) = pages.get(&(index as u32 + 1)).copied() else {
                continue;
            };
            let mut page = doc
                .get_dictionary(page_id)
                .map_err(|e| anyhow!("Page {} is not a dictionary: {e}", index + 1))?
                .clone();
            flatten_inherited(&doc, &mut page);
            let current = page.get(b"Rotate").and_then(Object::as_i64).unwrap_or(0);
            page.set("Rotate", (current + angle).rem_euclid(360));
            doc.objects.insert(page_id, Object::Dictionary(page));
        }
        save_pdf(&mut doc, &target)
    })
    .await?;
    done_result(output_path, "rotated.pdf", "application/pdf").await
}


#[cfg(test)]
mod tests {
    use std::{fs::File, io::Read};

    use super::{fixtures::*, *};
    use crate::{
        models::StoredJobInput,
        tools::{testing::context, Tool},
    };

    fn write_input(dir: &Path, name: &str, bytes: &[u8]) -> StoredInputFile {
        let input_dir = dir.join("input");
        std::fs::create_dir_all(&input_dir).expect("input dir");
        let path = input_dir.join(name);
        std::fs::write(&path, bytes).expect("write input");
        StoredInputFile {
            field: String::new(),
            original_name: name.to_string(),
            content_type: "application/pdf".to_string(),
            size: bytes.len() as u64,
            path,
        }
    }

    fn input_with(key: &str, files: Vec<StoredInputFile>, fields: &[(&str, &str)]) -> StoredJobInput {
        let mut input = StoredJobInput {
            total_files: files.len(),
            total_bytes: files.iter().map(|f| f.size).sum(),
            ..StoredJobInput::default()
        };
        input.files.insert(key.to_string(), files);
        for (name, value) in fields {
            input.fields.insert(name.to_string(), vec![value.to_string()]);
        }
        input
    }

    fn read(path: &PathBuf) -> Vec<u8> {
        std::fs::read(path).expect("read output")
    }

    #[tokio::test]
    async fn merge_concatenates_pages_in_upload_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write_input(dir.path(), "000-a.pdf", &sample_pdf(1));
        let b = write_input(dir.path(), "001-b.pdf", &sample_pdf(2));
        let ctx = context(dir.path(), Tool::MergePdf, input_with("files", vec![a, b], &[]));

        let output = merge_pdf(&ctx).await.expect("merge");
        assert_eq!(output.filename, "merged.pdf");
        let merged = Document::load_mem(&read(&output.output_path)).expect("merged pdf");
        let pages = merged.get_pages();
        assert_eq!(pages.len(), 3);
        let first = merged.get_dictionary(pages[&1]).expect("page dict");
        assert!(first.has(b"MediaBox"));
    }

    #[tokio::test]
    async fn merge_rejects_non_pdf_uploads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut notes = write_input(dir.path(), "000-notes.txt", b"hello");
        notes.original_name = "notes.txt".to_string();
        notes.content_type = "text/plain".to_string();
        let ctx = context(dir.path(), Tool::MergePdf, input_with("files", vec![notes], &[]));

        let err = merge_pdf(&ctx).await.expect_err("not a pdf");
        assert_eq!(err.to_string(), "\"notes.txt\" is not a PDF file.");
    }

    #[tokio::test]
    async fn split_without_ranges_yields_one_pdf_per_page() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_input(dir.path(), "000-doc.pdf", &sample_pdf(2));
        let ctx = context(dir.path(), Tool::SplitPdf, input_with("file", vec![file], &[]));

        let output = split_pdf(&ctx).await.expect("split");
        assert_eq!(output.content_type, "application/zip");

        let mut archive =
            zip::ZipArchive::new(File::open(&output.output_path).expect("open zip")).expect("zip");
        assert_eq!(archive.len(), 2);
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).expect("entry");
            assert_eq!(entry.name(), format!("split-{}-{}.pdf", index + 1, index + 1));
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).expect("read entry");
            assert_eq!(page_count_of(&bytes), 1);
        }
    }

    #[tokio::test]
    async fn split_honours_explicit_ranges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_input(dir.path(), "000-doc.pdf", &sample_pdf(3));
        let ctx = context(
            dir.path(),
            Tool::SplitPdf,
            input_with("file", vec![file], &[("ranges", "1-2,3")]),
        );

        let output = split_pdf(&ctx).await.expect("split");
        let mut archive =
            zip::ZipArchive::new(File::open(&output.output_path).expect("open zip")).expect("zip");
        let mut first = Vec::new();
        archive
            .by_name("split-1-1-2.pdf")
            .expect("first segment")
            .read_to_end(&mut first)
            .expect("read");
        assert_eq!(page_count_of(&first), 2);
    }

    #[tokio::test]
    async fn rotate_accumulates_existing_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_input(dir.path(), "000-doc.pdf", &sample_pdf(2));
        let ctx = context(
            dir.path(),
            Tool::RotatePdf,
            input_with("file", vec![file], &[("angle", "270"), ("pages", "2")]),
        );

        let output = rotate_pdf(&ctx).await.expect("rotate");
        let rotated = Document::load_mem(&read(&output.output_path)).expect("rotated pdf");
        let pages = rotated.get_pages();
        let rotation = |n: u32| {
            rotated
                .get_dictionary(pages[&n])
                .expect("page")
                .get(b"Rotate")
                .and_then(Object::as_i64)
                .unwrap_or(0)
        };
        assert_eq!(rotation(1), 0);
        assert_eq!(rotation(2), 270);
    }

    #[tokio::test]
    async fn rotate_rejects_odd_angles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_input(dir.path(), "000-doc.pdf", &sample_pdf(1));
        let ctx = context(
            dir.path(),
            Tool::RotatePdf,
            input_with("file", vec![file], &[("angle", "45")]),
        );
        let err = rotate_pdf(&ctx).await.expect_err("bad angle");
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
