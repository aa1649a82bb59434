//! Review spreadsheet: one row per crop with its thumbnail, name, text and
//! text position.

use std::{io::Cursor, path::Path};

use image::{imageops::FilterType, ImageFormat};
use rust_xlsxwriter::{Format, FormatAlign, Image, Workbook};
use tracing::instrument;

use crate::{OcrResult, Report, ReportLayout, Result};

pub const HEADERS: [&str; 4] = ["Image", "Image Name", "Text Content", "Coordinates"];
pub const SHEET_NAME: &str = "OCR Results";

/// Corner and centre listing for the Coordinates column. Uses the first text
/// block, or the crop rectangle in crop space when nothing was recognized.
pub fn format_coordinates(result: &OcrResult) -> String {
    if let Some(block) = result.text_blocks.first() {
        if let [tl, tr, br, bl, ..] = block.position.vertices.as_slice() {
            let center = block.position.center;
            return format!(
                "Top-left: ({}, {})\nTop-right: ({}, {})\nBottom-right: ({}, {})\nBottom-left: ({}, {})\nCenter: ({:.1}, {:.1})",
                tl.0, tl.1, tr.0, tr.1, br.0, br.1, bl.0, bl.1, center.x, center.y
            );
        }
    }
    let (w, h) = (result.image_size.width, result.image_size.height);
    format!(
        "Top-left: (0, 0)\nTop-right: ({w}, 0)\nBottom-right: ({w}, {h})\nBottom-left: (0, {h})\nCenter: ({:.1}, {:.1})",
        w as f64 / 2.0,
        h as f64 / 2.0
    )
}

fn thumbnail_png(path: &Path, size: u32) -> Result<Vec<u8>> {
    let thumbnail = image::open(path)?.to_rgb8();
    let thumbnail = image::imageops::resize(&thumbnail, size, size, FilterType::Lanczos3);
    let mut bytes = Vec::new();
    thumbnail.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

fn thumbnail_with_retries(path: &Path, layout: &ReportLayout) -> Option<Image> {
    for attempt in 1..=layout.image_retries {
        let image = thumbnail_png(path, layout.thumbnail_size).and_then(|bytes| {
            let image = Image::new_from_buffer(&bytes)?.set_scale_to_size(
                layout.thumbnail_size,
                layout.thumbnail_size,
                true,
            );
            Ok(image)
        });
        match image {
            Ok(image) => return Some(image),
            Err(err) => log::debug!(
                "Thumbnail attempt {attempt}/{} for {} failed: {err}",
                layout.image_retries,
                path.display()
            ),
        }
    }
    log::warn!(
        "Failed to add image after {} attempts: {}",
        layout.image_retries,
        path.display()
    );
    None
}

/// Writes the review workbook. Crop images are looked up in `images_dir` by
/// name; a missing image leaves its cell empty but keeps the row.
#[instrument(level = "debug", skip(report), fields(rows = report.results.len()))]
pub fn write_spreadsheet(report: &Report, images_dir: &Path, output_path: &Path) -> Result<()> {
    let layout = &report.layout;
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    let header = Format::new().set_bold();
    let wrapped = Format::new().set_text_wrap().set_align(FormatAlign::Top);

    for (col, title) in HEADERS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &header)?;
    }

    for (i, result) in report.results.iter().enumerate() {
        let row = i as u32 + 1;
        worksheet.set_row_height(row, layout.row_height)?;

        if let Some(image) = thumbnail_with_retries(&images_dir.join(&result.image_name), layout) {
            worksheet.insert_image(row, 0, &image)?;
        }
        worksheet.write_string_with_format(row, 1, result.image_name.as_str(), &wrapped)?;
        worksheet.write_string_with_format(row, 2, result.full_text.as_str(), &wrapped)?;
        worksheet.write_string_with_format(row, 3, format_coordinates(result), &wrapped)?;
    }

    for (col, width) in layout.column_widths.iter().enumerate() {
        worksheet.set_column_width(col as u16, *width)?;
    }

    workbook.save(output_path)?;
    log::info!("Spreadsheet report created: {}", output_path.display());
    Ok(())
}
