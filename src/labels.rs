//! Training label files derived from detections and recognized crops.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::{Error, OcrResult, OrderedDetection, Result};

/// One YOLO label line: class id and the box centre and size, normalized to
/// the image dimensions. Uses the detector's sub-pixel box when known.
pub fn yolo_line(detection: &OrderedDetection, width: u32, height: u32) -> String {
    let coords = detection.detection.coords;
    let [x1, y1, x2, y2] = detection
        .detection
        .raw_coords
        .map(|raw| raw.map(f64::from))
        .unwrap_or([coords.x1, coords.y1, coords.x2, coords.y2].map(f64::from));
    let (w, h) = (width as f64, height as f64);
    format!(
        "{} {:.6} {:.6} {:.6} {:.6}",
        detection.detection.class_id,
        (x1 + x2) / 2.0 / w,
        (y1 + y2) / 2.0 / h,
        (x2 - x1) / w,
        (y2 - y1) / h
    )
}

pub fn write_yolo_labels(
    path: &Path,
    detections: &[OrderedDetection],
    width: u32,
    height: u32,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path).map_err(|err| Error::io(path, err))?);
    for detection in detections {
        writeln!(writer, "{}", yolo_line(detection, width, height))
            .map_err(|err| Error::io(path, err))?;
    }
    writer.flush().map_err(|err| Error::io(path, err))?;
    Ok(())
}

/// Writes `<image name>\t<text>` for every entry with recognized text and
/// returns how many entries were skipped for being empty.
pub fn write_recognition_labels(path: &Path, results: &[OcrResult]) -> Result<usize> {
    let mut writer = BufWriter::new(File::create(path).map_err(|err| Error::io(path, err))?);
    let mut skipped = 0;
    for result in results {
        let text = result.full_text.trim();
        if text.is_empty() {
            skipped += 1;
            continue;
        }
        // Line breaks inside the text would split the record.
        let text = text.replace(['\r', '\n', '\t'], " ");
        writeln!(writer, "{}\t{text}", result.image_name).map_err(|err| Error::io(path, err))?;
    }
    writer.flush().map_err(|err| Error::io(path, err))?;
    log::info!(
        "Wrote {} recognition labels to {} ({skipped} empty skipped)",
        results.len() - skipped,
        path.display()
    );
    Ok(skipped)
}
