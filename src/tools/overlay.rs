use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use image::{ColorType, ImageFormat};
use lopdf::{
    content::{Content, Operation},
    dictionary, Dictionary, Document, Object, ObjectId, Stream,
};
use tokio::fs;

use super::{
    common::{
        assert_image_file, assert_page_limit, assert_pdf_file, assert_total_upload_limits,
        done_result, get_field, get_number_field, get_optional_file, get_required_file,
        get_required_files,
    },
    pages::parse_page_selection,
    pdf::{blocking, flatten_inherited, load_pdf, save_pdf},
    JobContext, ToolOutput,
};
use crate::{error::ApiError, models::StoredInputFile};

const FONT: &str = "PwFont";
const STATE: &str = "PwState";
const MARK: &str = "PwMark";
const MARK_MARGIN: f32 = 24.0;
const A4_PORTRAIT: (f32, f32) = (595.0, 842.0);

/// Decoded upload ready to become an image XObject.
#[derive(Debug)]
struct PdfImage {
    width: u32,
    height: u32,
    stream: Stream,
    mask: Option<Stream>,
}

impl PdfImage {
    fn ratio(&self) -> f32 {
        self.height as f32 / self.width as f32
    }
}

struct PlacedImage {
    id: ObjectId,
    ratio: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PageBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Center,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Position {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "top-left" => Self::TopLeft,
            "top-right" => Self::TopRight,
            "bottom-left" => Self::BottomLeft,
            "bottom-right" => Self::BottomRight,
            _ => Self::Center,
        }
    }

    /// Lower-left corner for a mark of the given size.
    fn place(self, area: &PageBox, width: f32, height: f32) -> (f32, f32) {
        let (x, y) = match self {
            Self::TopLeft => (MARK_MARGIN, area.height - height - MARK_MARGIN),
            Self::TopRight => (
                area.width - width - MARK_MARGIN,
                area.height - height - MARK_MARGIN,
            ),
            Self::BottomLeft => (MARK_MARGIN, MARK_MARGIN),
            Self::BottomRight => (area.width - width - MARK_MARGIN, MARK_MARGIN),
            Self::Center => ((area.width - width) / 2.0, (area.height - height) / 2.0),
        };
        (area.x + x, area.y + y)
    }
}

fn real(value: f32) -> Object {
    Object::Real(value)
}

fn decode_image(bytes: Vec<u8>, display_name: &str) -> Result<PdfImage, ApiError> {
    let invalid = || ApiError::bad_request(format!("\"{display_name}\" is not a readable JPG or PNG image."));
    let format = image::guess_format(&bytes).map_err(|_| invalid())?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(invalid());
    }
    let decoded = image::load_from_memory_with_format(&bytes, format).map_err(|_| invalid())?;
    let (width, height) = (decoded.width(), decoded.height());
    if width == 0 || height == 0 {
        return Err(invalid());
    }

    let image_dict = |color_space: &str| {
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => color_space,
            "BitsPerComponent" => 8_i64,
        }
    };

    // Baseline JPEGs are embedded as-is.
    if format == ImageFormat::Jpeg {
        let color_space = match decoded.color() {
            ColorType::L8 => Some("DeviceGray"),
            ColorType::Rgb8 => Some("DeviceRGB"),
            _ => None,
        };
        if let Some(color_space) = color_space {
            let mut dict = image_dict(color_space);
            dict.set("Filter", "DCTDecode");
            let mut stream = Stream::new(dict, bytes);
            stream.allows_compression = false;
            return Ok(PdfImage {
                width,
                height,
                stream,
                mask: None,
            });
        }
    }

    let rgba = decoded.to_rgba8();
    let pixels = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    let mut alpha = Vec::with_capacity(pixels);
    for pixel in rgba.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel.0[3]);
    }
    let mask = alpha
        .iter()
        .any(|a| *a != u8::MAX)
        .then(|| Stream::new(image_dict("DeviceGray"), alpha));
    Ok(PdfImage {
        width,
        height,
        stream: Stream::new(image_dict("DeviceRGB"), rgb),
        mask,
    })
}

async fn load_image(file: &StoredInputFile) -> Result<PdfImage, ApiError> {
    let bytes = fs::read(&file.path)
        .await
        .with_context(|| format!("Failed to read {}", file.path.display()))?;
    let name = file.original_name.clone();
    blocking(move || decode_image(bytes, &name)).await
}

fn add_image(doc: &mut Document, image: PdfImage) -> PlacedImage {
    let ratio = image.ratio();
    let PdfImage { mut stream, mask, .. } = image;
    if let Some(mask) = mask {
        let mask_id = doc.add_object(mask);
        stream.dict.set("SMask", mask_id);
    }
    PlacedImage {
        id: doc.add_object(stream),
        ratio,
    }
}

fn standard_font(base_font: &str) -> Dictionary {
    dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base_font,
        "Encoding" => "WinAnsiEncoding",
    }
}

fn opacity_state(opacity: f32) -> Dictionary {
    dictionary! {
        "Type" => "ExtGState",
        "CA" => real(opacity),
        "ca" => real(opacity),
    }
}

/// Standard 14 fonts only cover WinAnsi; anything outside Latin-1 prints as `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match u32::from(c) {
            code @ 0x20..=0x7e | code @ 0xa0..=0xff => code as u8,
            _ => b'?',
        })
        .collect()
}

/// Helvetica averages a little over half an em per glyph.
fn approx_text_width(text: &str, size: f32) -> f32 {
    text.chars().count() as f32 * size * 0.56
}

fn page_box(page: &Dictionary) -> PageBox {
    let corners = page
        .get(b"MediaBox")
        .and_then(Object::as_array)
        .ok()
        .map(|values| values.iter().map(Object::as_float).collect::<Result<Vec<_>, _>>());
    match corners {
        Some(Ok(values)) if values.len() == 4 => PageBox {
            x: values[0].min(values[2]),
            y: values[1].min(values[3]),
            width: (values[2] - values[0]).abs(),
            height: (values[3] - values[1]).abs(),
        },
        _ => PageBox {
            x: 0.0,
            y: 0.0,
            width: 612.0,
            height: 792.0,
        },
    }
}

fn page_dictionary(doc: &Document, page_id: ObjectId) -> Result<Dictionary, ApiError> {
    let mut page = doc
        .get_dictionary(page_id)
        .map_err(|e| anyhow!("Page {page_id:?} is not a dictionary: {e}"))?
        .clone();
    flatten_inherited(doc, &mut page);
    Ok(page)
}

fn resolved_dict(doc: &Document, object: Option<&Object>) -> Dictionary {
    match object {
        Some(Object::Dictionary(dict)) => dict.clone(),
        Some(Object::Reference(id)) => doc
            .get_dictionary(*id)
            .map(Dictionary::clone)
            .unwrap_or_else(|_| Dictionary::new()),
        _ => Dictionary::new(),
    }
}

/// Registers `resources` on the page and draws `operations` above its existing
/// content, isolated from whatever graphics state that content leaves behind.
fn stamp_page(
    doc: &mut Document,
    page_id: ObjectId,
    mut page: Dictionary,
    resources: &[(&str, &str, ObjectId)],
    operations: Vec<Operation>,
) -> Result<(), ApiError> {
    let mut page_resources = resolved_dict(doc, page.get(b"Resources").ok());
    for (category, name, id) in resources {
        let mut entries = resolved_dict(doc, page_resources.get(category.as_bytes()).ok());
        entries.set(*name, *id);
        page_resources.set(*category, Object::Dictionary(entries));
    }
    page.set("Resources", Object::Dictionary(page_resources));

    let mut contents = match page.get(b"Contents") {
        Ok(Object::Array(items)) => items.clone(),
        Ok(item @ Object::Reference(_)) => vec![item.clone()],
        _ => Vec::new(),
    };
    let mut overlay = vec![Operation::new("Q", vec![])];
    overlay.extend(operations);
    let encoded = Content {
        operations: overlay,
    }
    .encode()
    .map_err(|e| anyhow!("Failed to encode page overlay: {e}"))?;

    let save_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let overlay_id = doc.add_object(Stream::new(Dictionary::new(), encoded));
    contents.insert(0, Object::Reference(save_id));
    contents.push(Object::Reference(overlay_id));
    page.set("Contents", contents);
    doc.objects.insert(page_id, Object::Dictionary(page));
    Ok(())
}

fn image_operations(x: f32, y: f32, width: f32, height: f32, with_state: bool) -> Vec<Operation> {
    let mut ops = vec![Operation::new("q", vec![])];
    if with_state {
        ops.push(Operation::new("gs", vec![Object::Name(STATE.into())]));
    }
    ops.extend([
        Operation::new(
            "cm",
            vec![real(width), real(0.0), real(0.0), real(height), real(x), real(y)],
        ),
        Operation::new("Do", vec![Object::Name(MARK.into())]),
        Operation::new("Q", vec![]),
    ]);
    ops
}

struct TextMark<'a> {
    text: &'a str,
    size: f32,
    color: [f32; 3],
    x: f32,
    y: f32,
    degrees: f32,
    with_state: bool,
}

fn text_operations(mark: TextMark<'_>) -> Vec<Operation> {
    let (sin, cos) = mark.degrees.to_radians().sin_cos();
    let [r, g, b] = mark.color;
    let mut ops = vec![Operation::new("q", vec![])];
    if mark.with_state {
        ops.push(Operation::new("gs", vec![Object::Name(STATE.into())]));
    }
    ops.extend([
        Operation::new("rg", vec![real(r), real(g), real(b)]),
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![Object::Name(FONT.into()), real(mark.size)]),
        Operation::new(
            "Tm",
            vec![real(cos), real(sin), real(-sin), real(cos), real(mark.x), real(mark.y)],
        ),
        Operation::new("Tj", vec![Object::string_literal(win_ansi(mark.text))]),
        Operation::new("ET", vec![]),
        Operation::new("Q", vec![]),
    ]);
    ops
}

fn page_number(ctx: &JobContext, page_count: usize) -> Result<usize, ApiError> {
    let page = get_number_field(&ctx.input, "page", 1.0, 1.0).round() as usize;
    if page < 1 || page > page_count {
        return Err(ApiError::bad_request(format!(
            "Page must be between 1 and {page_count}."
        )));
    }
    Ok(page)
}

fn percent(ctx: &JobContext, key: &str, fallback: f32, min: f32, low: f32, high: f32) -> f32 {
    get_number_field(&ctx.input, key, fallback, min).clamp(low, high)
}

async fn load_checked_pdf(ctx: &JobContext, file: StoredInputFile) -> Result<(Document, BTreeMap<u32, ObjectId>), ApiError> {
    let doc = blocking(move || load_pdf(&file)).await?;
    let pages = doc.get_pages();
    assert_page_limit(pages.len(), &ctx.limits)?;
    Ok((doc, pages))
}

pub async fn watermark(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?.clone();
    assert_pdf_file(&file)?;
    let image_file = get_optional_file(&ctx.input, "image")?.cloned();
    if let Some(image) = &image_file {
        assert_image_file(image)?;
    }

    let text = get_field(&ctx.input, "text", "").trim().to_string();
    if text.is_empty() && image_file.is_none() {
        return Err(ApiError::bad_request("Provide watermark text or image."));
    }
    let opacity = percent(ctx, "opacity", 0.3, 0.0, 0.05, 1.0);
    let scale = percent(ctx, "scale", 0.35, 0.0, 0.1, 2.0);
    let position = Position::parse(get_field(&ctx.input, "position", "center"));

    let (mut doc, pages) = load_checked_pdf(ctx, file).await?;
    let selected = parse_page_selection(get_field(&ctx.input, "pages", "all"), pages.len())?;
    let mark = match &image_file {
        Some(image) => Some(load_image(image).await?),
        None => None,
    };

    ctx.set_progress(30.0, format!("Watermarking {} page(s)...", selected.len()))
        .await;
    let output_path = ctx.output_path("watermarked.pdf");
    let target = output_path.clone();
    blocking(move || {
        let font_id = (!text.is_empty()).then(|| doc.add_object(standard_font("Helvetica-Bold")));
        let state_id = doc.add_object(opacity_state(opacity));
        let mark = mark.map(|image| add_image(&mut doc, image));

        for index in selected {
            let Some(page_id) = pages.get(&(index as u32 + 1)).copied() else {
                continue;
            };
            let page = page_dictionary(&doc, page_id)?;
            let area = page_box(&page);
            let mut resources = vec![("ExtGState", STATE, state_id)];
            let mut ops = Vec::new();

            if let Some(mark) = &mark {
                let width = area.width * scale;
                let height = width * mark.ratio;
                let (x, y) = position.place(&area, width, height);
                resources.push(("XObject", MARK, mark.id));
                ops.extend(image_operations(x, y, width, height, true));
            }
            if let Some(font_id) = font_id {
                let size = (area.width * 0.06 * scale).round().max(18.0);
                let (x, y) = position.place(&area, approx_text_width(&text, size), size);
                resources.push(("Font", FONT, font_id));
                ops.extend(text_operations(TextMark {
                    text: &text,
                    size,
                    color: [0.65, 0.67, 0.75],
                    x,
                    y,
                    degrees: if position == Position::Center { 30.0 } else { 0.0 },
                    with_state: true,
                }));
            }
            stamp_page(&mut doc, page_id, page, &resources, ops)?;
        }
        doc.compress();
        save_pdf(&mut doc, &target)
    })
    .await?;
    ctx.set_progress(90.0, "Saving watermarked PDF...").await;
    done_result(output_path, "watermarked.pdf", "application/pdf").await
}

pub async fn edit_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?.clone();
    assert_pdf_file(&file)?;
    let (mut doc, pages) = load_checked_pdf(ctx, file).await?;
    let page_number = page_number(ctx, pages.len())?;

    let text = get_field(&ctx.input, "text", "").trim().to_string();
    if text.is_empty() {
        return Err(ApiError::bad_request("Text is required for edit."));
    }
    let text_x = percent(ctx, "textX", 15.0, 0.0, 0.0, 100.0);
    let text_y = percent(ctx, "textY", 75.0, 0.0, 0.0, 100.0);
    let text_size = percent(ctx, "textSize", 18.0, 1.0, 10.0, 72.0);
    let box_x = percent(ctx, "highlightX", 12.0, 0.0, 0.0, 100.0);
    let box_y = percent(ctx, "highlightY", 68.0, 0.0, 0.0, 100.0);
    let box_width = percent(ctx, "highlightWidth", 40.0, 1.0, 5.0, 100.0);
    let box_height = percent(ctx, "highlightHeight", 8.0, 1.0, 2.0, 100.0);
    let [r, g, b] = match get_field(&ctx.input, "highlightColor", "yellow") {
        "green" => [0.5, 0.95, 0.5],
        "blue" => [0.5, 0.8, 1.0],
        _ => [1.0, 0.95, 0.45],
    };

    ctx.set_progress(40.0, format!("Editing page {page_number}...")).await;
    let output_path = ctx.output_path("edited.pdf");
    let target = output_path.clone();
    let page_id = pages[&(page_number as u32)];
    blocking(move || {
        let font_id = doc.add_object(standard_font("Helvetica"));
        let state_id = doc.add_object(opacity_state(0.45));
        let page = page_dictionary(&doc, page_id)?;
        let area = page_box(&page);

        let mut ops = vec![
            Operation::new("q", vec![]),
            Operation::new("gs", vec![Object::Name(STATE.into())]),
            Operation::new("rg", vec![real(r), real(g), real(b)]),
            Operation::new(
                "re",
                vec![
                    real(area.x + area.width * box_x / 100.0),
                    real(area.y + area.height * box_y / 100.0),
                    real(area.width * box_width / 100.0),
                    real(area.height * box_height / 100.0),
                ],
            ),
            Operation::new("f", vec![]),
            Operation::new("Q", vec![]),
        ];
        ops.extend(text_operations(TextMark {
            text: &text,
            size: text_size,
            color: [0.07, 0.07, 0.07],
            x: area.x + area.width * text_x / 100.0,
            y: area.y + area.height * text_y / 100.0,
            degrees: 0.0,
            with_state: false,
        }));
        stamp_page(
            &mut doc,
            page_id,
            page,
            &[("Font", FONT, font_id), ("ExtGState", STATE, state_id)],
            ops,
        )?;
        doc.compress();
        save_pdf(&mut doc, &target)
    })
    .await?;
    done_result(output_path, "edited.pdf", "application/pdf").await
}

pub async fn sign_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let file = get_required_file(&ctx.input, "file")?.clone();
    let signature_file = get_required_file(&ctx.input, "signature")?.clone();
    assert_pdf_file(&file)?;
    assert_image_file(&signature_file)?;

    let (mut doc, pages) = load_checked_pdf(ctx, file).await?;
    let page_number = page_number(ctx, pages.len())?;
    let x_percent = percent(ctx, "xPercent", 50.0, 0.0, 0.0, 100.0);
    let y_percent = percent(ctx, "yPercent", 20.0, 0.0, 0.0, 100.0);
    let width_percent = percent(ctx, "widthPercent", 25.0, 0.0, 5.0, 80.0);
    let signature = load_image(&signature_file).await?;

    ctx.set_progress(50.0, format!("Signing page {page_number}...")).await;
    let output_path = ctx.output_path("signed.pdf");
    let target = output_path.clone();
    let page_id = pages[&(page_number as u32)];
    blocking(move || {
        let signature = add_image(&mut doc, signature);
        let page = page_dictionary(&doc, page_id)?;
        let area = page_box(&page);

        let width = area.width * width_percent / 100.0;
        let height = signature.ratio * width;
        let x = (area.width * x_percent / 100.0).max(0.0).min(area.width - width);
        let y = (area.height * y_percent / 100.0).max(0.0).min(area.height - height);
        let ops = image_operations(area.x + x, area.y + y, width, height, false);
        stamp_page(&mut doc, page_id, page, &[("XObject", MARK, signature.id)], ops)?;
        doc.compress();
        save_pdf(&mut doc, &target)
    })
    .await?;
    done_result(output_path, "signed.pdf", "application/pdf").await
}

fn images_document(images: Vec<PdfImage>, page_size: (f32, f32), margin: f32) -> Result<Document, ApiError> {
    let (page_width, page_height) = page_size;
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::with_capacity(images.len());

    for image in images {
        let (source_width, source_height) = (image.width as f32, image.height as f32);
        let placed = add_image(&mut doc, image);
        let available_width = (page_width - margin * 2.0).max(1.0);
        let available_height = (page_height - margin * 2.0).max(1.0);
        let fit = (available_width / source_width).min(available_height / source_height);
        let (width, height) = (source_width * fit, source_height * fit);
        let x = (page_width - width) / 2.0;
        let y = (page_height - height) / 2.0;

        let content = Content {
            operations: image_operations(x, y, width, height, false),
        }
        .encode()
        .map_err(|e| anyhow!("Failed to encode image page: {e}"))?;
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![real(0.0), real(0.0), real(page_width), real(page_height)],
            "Resources" => dictionary! {
                "XObject" => dictionary! { MARK => placed.id },
            },
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    Ok(doc)
}

pub async fn jpg_to_pdf(ctx: &JobContext) -> Result<ToolOutput, ApiError> {
    assert_total_upload_limits(&ctx.input, &ctx.limits)?;
    let files = get_required_files(&ctx.input, "files", 1, 5)?;
    for file in files {
        assert_image_file(file)?;
    }

    let page_size = match get_field(&ctx.input, "orientation", "portrait") {
        "landscape" => (A4_PORTRAIT.1, A4_PORTRAIT.0),
        _ => A4_PORTRAIT,
    };
    let margin = get_number_field(&ctx.input, "margin", 24.0, f32::NEG_INFINITY).clamp(0.0, 80.0);

    let mut images = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        images.push(load_image(file).await?);
        ctx.set_progress(
            ((index + 1) as f64 / files.len() as f64) * 80.0,
            format!("Loaded {}/{} image(s)...", index + 1, files.len()),
        )
        .await;
    }

    let output_path = ctx.output_path("images.pdf");
    let target = output_path.clone();
    blocking(move || {
        let mut doc = images_document(images, page_size, margin)?;
        save_pdf(&mut doc, &target)
    })
    .await?;
    done_result(output_path, "images.pdf", "application/pdf").await
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

    /// A `width` x `height` image in the requested format; PNGs get a transparent corner.
    pub fn sample_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let mut pixels = RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255]));
        pixels.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        let image = match format {
            ImageFormat::Png => DynamicImage::ImageRgba8(pixels),
            _ => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(pixels).to_rgb8()),
        };
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, format).expect("encode sample image");
        bytes.into_inner()
    }
}
