use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use tracing::instrument;

use crate::{BoxCoords, Error, OcrResult, OrderedDetection, Result};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_FILL: Rgb<u8> = Rgb([144, 238, 144]);
const TEXT_BORDER: Rgb<u8> = Rgb([0, 255, 0]);
const EMPTY_FILL: Rgb<u8> = Rgb([255, 130, 71]);
const EMPTY_BORDER: Rgb<u8> = Rgb([255, 165, 0]);
const FILL_ALPHA: f32 = 0.4;
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_SCALE: f32 = 16.0;
const TEXT_SCALE: f32 = 20.0;
const LABEL_GAP: i32 = 4;

/// Loads a TrueType/OpenType font for text on pictures. Vietnamese text needs
/// a font with the full set of diacritics.
pub fn load_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path).map_err(|err| Error::io(path, err))?;
    FontArc::try_from_vec(bytes)
        .map_err(|err| Error::config(format!("invalid font {}: {err}", path.display())))
}

/// Top-left corner for a label of `text_height` sitting just above the box,
/// kept inside the picture.
pub(crate) fn label_origin(coords: &BoxCoords, text_height: u32) -> (i32, i32) {
    (coords.x1, (coords.y1 - LABEL_GAP - text_height as i32).max(0))
}

/// Top-left corner that centres a `text_width` x `text_height` run in the box.
pub(crate) fn centered_origin(coords: &BoxCoords, text_width: u32, text_height: u32) -> (i32, i32) {
    (
        coords.x1 + (coords.width() - text_width as i32) / 2,
        coords.y1 + (coords.height() - text_height as i32) / 2,
    )
}

pub(crate) fn detection_label(detection: &OrderedDetection) -> String {
    format!(
        "{}: {:.2}",
        detection.detection.class_label, detection.detection.confidence
    )
}

fn to_rect(coords: &BoxCoords) -> Option<Rect> {
    (coords.width() > 0 && coords.height() > 0)
        .then(|| Rect::at(coords.x1, coords.y1).of_size(coords.width() as u32, coords.height() as u32))
}

/// Two pixel wide outline, drawn inward.
fn draw_border(canvas: &mut RgbImage, coords: &BoxCoords, color: Rgb<u8>) {
    if let Some(rect) = to_rect(coords) {
        draw_hollow_rect_mut(canvas, rect, color);
    }
    let inner = BoxCoords::new(coords.x1 + 1, coords.y1 + 1, coords.x2 - 1, coords.y2 - 1);
    if let Some(rect) = to_rect(&inner) {
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

fn blend_fill(canvas: &mut RgbImage, coords: &BoxCoords, color: Rgb<u8>, alpha: f32) {
    let x_range = coords.x1.max(0) as u32..(coords.x2.max(0) as u32).min(canvas.width());
    let y_range = coords.y1.max(0) as u32..(coords.y2.max(0) as u32).min(canvas.height());
    for y in y_range {
        for x in x_range.clone() {
            let pixel = canvas.get_pixel_mut(x, y);
            for (channel, fill) in pixel.0.iter_mut().zip(color.0) {
                *channel = (alpha * fill as f32 + (1.0 - alpha) * *channel as f32).round() as u8;
            }
        }
    }
}

/// Source image with every detection outlined.
#[instrument(level = "debug", skip_all)]
pub fn draw_detections(image: &DynamicImage, detections: &[OrderedDetection]) -> RgbImage {
    let mut canvas = image.to_rgb8();
    for detection in detections {
        draw_border(&mut canvas, &detection.detection.coords, BOX_COLOR);
    }
    canvas
}

/// Outlines plus a `class: confidence` label above each box. Labels are only
/// drawn when a font is available.
#[instrument(level = "debug", skip_all)]
pub fn draw_labeled_detections(
    image: &DynamicImage,
    detections: &[OrderedDetection],
    font: Option<&FontArc>,
) -> RgbImage {
    let mut canvas = draw_detections(image, detections);
    let Some(font) = font else {
        return canvas;
    };
    for detection in detections {
        let label = detection_label(detection);
        let (_, text_height) = text_size(PxScale::from(LABEL_SCALE), font, &label);
        let (x, y) = label_origin(&detection.detection.coords, text_height);
        draw_text_mut(&mut canvas, BOX_COLOR, x, y, PxScale::from(LABEL_SCALE), font, &label);
    }
    canvas
}

/// Source image with every recognized crop shaded: green where text was
/// found, orange where it was not. With a font, the recognized text is
/// written centred in its box.
#[instrument(level = "debug", skip_all)]
pub fn draw_results(image: &DynamicImage, results: &[OcrResult], font: Option<&FontArc>) -> RgbImage {
    let mut canvas = image.to_rgb8();
    for result in results {
        let Some(coords) = result.original_crop_coords else {
            continue;
        };
        let (fill, border) = if result.has_text() {
            (TEXT_FILL, TEXT_BORDER)
        } else {
            (EMPTY_FILL, EMPTY_BORDER)
        };
        blend_fill(&mut canvas, &coords, fill, FILL_ALPHA);
        draw_border(&mut canvas, &coords, border);

        if let (Some(font), true) = (font, result.has_text()) {
            let text = result.full_text.trim();
            let (w, h) = text_size(PxScale::from(TEXT_SCALE), font, text);
            let (x, y) = centered_origin(&coords, w, h);
            draw_text_mut(&mut canvas, TEXT_COLOR, x, y, PxScale::from(TEXT_SCALE), font, text);
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Detection, ImageSize};

    #[test]
    fn outlines_detections_two_pixels_wide() {
        let image = DynamicImage::new_rgb8(40, 40);
        let detections = vec![OrderedDetection {
            reading_index: 1,
            detection: Detection {
                detector_index: 0,
                coords: BoxCoords::new(10, 10, 30, 30),
                class_id: 0,
                class_label: "simple_handwritten".to_string(),
                confidence: 0.9,
                raw_coords: None,
            },
        }];
        let canvas = draw_detections(&image, &detections);
        assert_eq!(*canvas.get_pixel(10, 20), BOX_COLOR);
        assert_eq!(*canvas.get_pixel(11, 20), BOX_COLOR);
        assert_eq!(*canvas.get_pixel(12, 20), Rgb([0, 0, 0]));
        assert_eq!(*canvas.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn shades_by_recognition_outcome() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 30, Rgb([0, 0, 0])));
        let entry = |x1: i32, text: &str| OcrResult {
            reading_index: None,
            image_name: String::new(),
            timestamp: String::new(),
            image_size: ImageSize {
                width: 20,
                height: 20,
            },
            original_crop_coords: Some(BoxCoords::new(x1, 5, x1 + 20, 25)),
            full_text: text.to_string(),
            text_blocks: Vec::new(),
        };
        let canvas = draw_results(&image, &[entry(0, "có chữ"), entry(30, "  ")], None);

        let expect = |c: Rgb<u8>| Rgb(c.0.map(|v| (FILL_ALPHA * v as f32).round() as u8));
        assert_eq!(*canvas.get_pixel(10, 15), expect(TEXT_FILL));
        assert_eq!(*canvas.get_pixel(40, 15), expect(EMPTY_FILL));
        assert_eq!(*canvas.get_pixel(30, 15), EMPTY_BORDER);
        assert_eq!(*canvas.get_pixel(25, 2), Rgb([0, 0, 0]));
    }

    fn ordered(coords: BoxCoords) -> OrderedDetection {
        OrderedDetection {
            reading_index: 1,
            detection: Detection {
                detector_index: 0,
                coords,
                class_id: 1,
                class_label: "special_character".to_string(),
                confidence: 0.876,
                raw_coords: None,
            },
        }
    }

    #[test]
    fn label_text_and_placement() {
        let detection = ordered(BoxCoords::new(10, 30, 60, 50));
        assert_eq!(detection_label(&detection), "special_character: 0.88");
        assert_eq!(label_origin(&detection.detection.coords, 12), (10, 14));
        // Boxes at the top edge keep their label inside the picture.
        assert_eq!(label_origin(&BoxCoords::new(10, 5, 60, 25), 12), (10, 0));
    }

    #[test]
    fn text_is_centred_in_its_box() {
        assert_eq!(centered_origin(&BoxCoords::new(100, 40, 160, 70), 20, 10), (120, 50));
        // Text wider than the box overhangs both sides evenly.
        assert_eq!(centered_origin(&BoxCoords::new(0, 0, 10, 10), 30, 10), (-10, 0));
    }

    #[test]
    fn labeled_picture_without_font_matches_outlines() {
        let image = DynamicImage::new_rgb8(80, 60);
        let detections = vec![ordered(BoxCoords::new(10, 30, 60, 50))];
        assert_eq!(
            draw_labeled_detections(&image, &detections, None),
            draw_detections(&image, &detections)
        );
    }

    #[test]
    fn unusable_font_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ttf");
        std::fs::write(&path, b"not a font").unwrap();
        assert!(matches!(load_font(&path), Err(Error::Configuration(_))));
        assert!(matches!(
            load_font(&dir.path().join("missing.ttf")),
            Err(Error::Io { .. })
        ));
    }
}
