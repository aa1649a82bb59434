use serde::{Deserialize, Serialize};

/// Axis-aligned box in source image pixels. Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoxCoords {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoxCoords {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn center_x(&self) -> i32 {
        (self.x1 + self.x2).div_euclid(2)
    }

    pub fn center_y(&self) -> i32 {
        (self.y1 + self.y2).div_euclid(2)
    }
}

impl From<[i32; 4]> for BoxCoords {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoxCoords> for [i32; 4] {
    fn from(coords: BoxCoords) -> Self {
        [coords.x1, coords.y1, coords.x2, coords.y2]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Position in the raw detector output.
    pub detector_index: usize,
    pub coords: BoxCoords,
    pub class_id: usize,
    pub class_label: String,
    pub confidence: f32,
    /// Sub-pixel box `[x1, y1, x2, y2]` as the detector produced it, before
    /// truncation to `coords`.
    pub raw_coords: Option<[f32; 4]>,
}

impl Detection {
    pub fn center(&self) -> (i32, i32) {
        (self.coords.center_x(), self.coords.center_y())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderedDetection {
    /// 1-based position in reading order. Identifies the crop in every later stage.
    pub reading_index: usize,
    pub detection: Detection,
}

impl OrderedDetection {
    pub fn crop_file_name(&self) -> String {
        crop_file_name(self.reading_index, &self.detection.class_label)
    }
}

pub fn crop_file_name(reading_index: usize, class_label: &str) -> String {
    format!("crop_{reading_index:03}_{class_label}.png")
}

/// One entry of `processed_results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub index: usize,
    pub class_name: String,
    pub confidence: f32,
    pub coords: BoxCoords,
    pub center_x: i32,
    pub center_y: i32,
}

impl From<&OrderedDetection> for ProcessedEntry {
    fn from(ordered: &OrderedDetection) -> Self {
        let detection = &ordered.detection;
        Self {
            index: ordered.reading_index,
            class_name: detection.class_label.clone(),
            confidence: detection.confidence,
            coords: detection.coords,
            center_x: detection.coords.center_x(),
            center_y: detection.coords.center_y(),
        }
    }
}

impl ProcessedEntry {
    /// Rebuilds the ordered detection this entry was written from. The raw
    /// detector position and class id are not persisted.
    pub fn to_ordered(&self) -> OrderedDetection {
        OrderedDetection {
            reading_index: self.index,
            detection: Detection {
                detector_index: self.index.saturating_sub(1),
                coords: self.coords,
                class_id: 0,
                class_label: self.class_name.clone(),
                confidence: self.confidence,
                raw_coords: None,
            },
        }
    }
}

/// Polygon vertex, serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex(pub i32, pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Center {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Absolute coordinates in the source image.
    pub vertices: Vec<Vertex>,
    pub center: Center,
    /// Coordinates local to the crop.
    pub relative_vertices: Vec<Vertex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// OCR output for one crop. One entry of `json_results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading_index: Option<usize>,
    pub image_name: String,
    pub timestamp: String,
    pub image_size: ImageSize,
    pub original_crop_coords: Option<BoxCoords>,
    pub full_text: String,
    pub text_blocks: Vec<TextBlock>,
}

impl OcrResult {
    pub fn has_text(&self) -> bool {
        !self.full_text.trim().is_empty()
    }
}

/// A crop written to disk, ready for recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedCrop {
    pub reading_index: usize,
    pub file_name: String,
    pub path: std::path::PathBuf,
    pub coords: BoxCoords,
    pub size: ImageSize,
}

/// Per-item outcome of a concurrent stage, tagged with the reading index.
#[derive(Debug)]
pub struct ItemOutcome<T, E> {
    pub reading_index: usize,
    pub result: Result<T, E>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLayout {
    pub column_widths: [f64; 4],
    pub thumbnail_size: u32,
    pub row_height: f64,
    pub image_retries: usize,
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self {
            column_widths: [12.0, 20.0, 40.0, 35.0],
            thumbnail_size: 75,
            row_height: 60.0,
            image_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub results: Vec<OcrResult>,
    pub layout: ReportLayout,
}
