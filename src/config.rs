//! Pipeline configuration, read from a TOML file.
//!
//! Everything except input paths has a default, so a minimal file only names
//! the model, the page image and the credentials.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DetectionOptions, Error, ReportLayout, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
    pub report: ReportLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// ONNX detector weights.
    pub model: Option<PathBuf>,
    /// Page image to process.
    pub image: Option<PathBuf>,
    /// Service credentials JSON.
    pub credentials: Option<PathBuf>,
    /// Font for text drawn on pictures. Without one only boxes are drawn.
    pub font: Option<PathBuf>,
    pub crops_dir: PathBuf,
    pub annotated_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model: None,
            image: None,
            credentials: None,
            font: None,
            crops_dir: "data_results/imgs".into(),
            annotated_dir: "data_results/result_images".into(),
            output_dir: "data_results/ocr_output".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
    pub max_detections: usize,
    /// Row tolerance in pixels.
    pub y_threshold: i32,
    /// Row tolerance as a fraction of image height. Overrides `y_threshold`.
    pub y_threshold_ratio: Option<f32>,
    pub min_box_size: i32,
    pub class_names: Vec<String>,
    pub threads: usize,
    pub write_yolo_labels: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            iou_threshold: 0.45,
            input_size: 640,
            max_detections: 300,
            y_threshold: 30,
            y_threshold_ratio: None,
            min_box_size: 5,
            class_names: vec![
                "simple_handwritten".to_string(),
                "special_character".to_string(),
            ],
            threads: 6,
            write_yolo_labels: true,
        }
    }
}

impl DetectionConfig {
    pub fn options(&self) -> DetectionOptions {
        DetectionOptions {
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            max_detections: self.max_detections,
            y_threshold: self.y_threshold,
            y_threshold_ratio: self.y_threshold_ratio,
            min_box_size: self.min_box_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub endpoint: String,
    pub language_hints: Vec<String>,
    pub timeout_secs: u64,
    pub workers: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://vision.googleapis.com/v1/images:annotate".to_string(),
            language_hints: vec!["vi".to_string(), "vi-VN".to_string()],
            timeout_secs: 30,
            workers: 4,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::config(format!("cannot read config {}: {err}", path.display()))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.check_values()?;
        Ok(config)
    }

    fn check_values(&self) -> Result<()> {
        let detection = &self.detection;
        if !(0.0..=1.0).contains(&detection.confidence_threshold) {
            return Err(Error::config("confidence_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&detection.iou_threshold) {
            return Err(Error::config("iou_threshold must be within [0, 1]"));
        }
        if detection.y_threshold < 0 {
            return Err(Error::config("y_threshold must not be negative"));
        }
        if let Some(ratio) = detection.y_threshold_ratio {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(Error::config("y_threshold_ratio must be within (0, 1)"));
            }
        }
        if detection.input_size == 0 || detection.input_size % 32 != 0 {
            return Err(Error::config("input_size must be a positive multiple of 32"));
        }
        if self.recognition.workers == 0 {
            return Err(Error::config("recognition.workers must be at least 1"));
        }
        if self.report.image_retries == 0 {
            return Err(Error::config("report.image_retries must be at least 1"));
        }
        Ok(())
    }

    pub fn model_path(&self) -> Result<&Path> {
        existing_file("model", self.paths.model.as_deref())
    }

    pub fn image_path(&self) -> Result<&Path> {
        existing_file("image", self.paths.image.as_deref())
    }

    pub fn credentials_path(&self) -> Result<&Path> {
        let path = existing_file("credentials", self.paths.credentials.as_deref())?;
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Err(Error::config(format!(
                "credentials must be a JSON file: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    pub fn font_path(&self) -> Result<Option<&Path>> {
        match self.paths.font.as_deref() {
            Some(path) => existing_file("font", Some(path)).map(Some),
            None => Ok(None),
        }
    }
}

fn existing_file<'a>(name: &str, path: Option<&'a Path>) -> Result<&'a Path> {
    let path = path.ok_or_else(|| Error::config(format!("no {name} path configured")))?;
    if !path.is_file() {
        return Err(Error::config(format!(
            "{name} path does not exist: {}",
            path.display()
        )));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_pipeline_constants() {
        let config = Config::default();
        assert_eq!(config.detection.y_threshold, 30);
        assert_eq!(config.detection.min_box_size, 5);
        assert_eq!(config.detection.confidence_threshold, 0.3);
        assert_eq!(config.recognition.workers, 4);
        assert_eq!(config.recognition.language_hints, vec!["vi", "vi-VN"]);
        assert_eq!(config.report.thumbnail_size, 75);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[paths]
model = "model/best.onnx"

[detection]
y_threshold_ratio = 0.02
class_names = ["line"]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.paths.model, Some(PathBuf::from("model/best.onnx")));
        assert_eq!(config.paths.crops_dir, PathBuf::from("data_results/imgs"));
        assert_eq!(config.detection.y_threshold_ratio, Some(0.02));
        assert_eq!(config.detection.class_names, vec!["line"]);
        assert_eq!(config.detection.iou_threshold, 0.45);
        assert_eq!(config.recognition.timeout_secs, 30);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[detection]\nconfidence_threshold = 1.5").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn missing_config_file_is_a_configuration_error() {
        let err = Config::load(Path::new("/nonexistent/ocrlabel.toml")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn credentials_must_exist_and_be_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();

        assert!(matches!(
            config.credentials_path(),
            Err(Error::Configuration(_))
        ));

        let txt = dir.path().join("credentials.txt");
        std::fs::write(&txt, "{}").unwrap();
        config.paths.credentials = Some(txt);
        assert!(matches!(
            config.credentials_path(),
            Err(Error::Configuration(_))
        ));

        let json = dir.path().join("credentials.json");
        std::fs::write(&json, "{}").unwrap();
        config.paths.credentials = Some(json.clone());
        assert_eq!(config.credentials_path().unwrap(), json.as_path());
    }

    #[test]
    fn font_is_optional_but_must_exist_when_named() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        assert_eq!(config.font_path().unwrap(), None);

        config.paths.font = Some(dir.path().join("BeVietnamPro-Regular.ttf"));
        assert!(matches!(config.font_path(), Err(Error::Configuration(_))));
    }
}
