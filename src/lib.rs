use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub mod aggregate;
pub mod config;
pub mod cropper;
pub mod draw;
mod error;
pub mod labels;
pub mod reading_order;
pub mod report;
mod result;
pub mod util;
pub mod vision_client;
pub mod workers;
pub mod yolo_net;

use ab_glyph::FontArc;
use config::PathsConfig;
pub use config::Config;
pub use error::*;
use image::DynamicImage;
pub use result::*;
use tracing::instrument;
pub use vision_client::{Recognizer, VisionClient};
pub use yolo_net::YoloNet;

pub use ort as runtime;

pub const PROCESSED_RESULTS: &str = "processed_results.json";
pub const JSON_RESULTS: &str = "json_results.json";
pub const SPREADSHEET: &str = "ocr_summary.xlsx";
pub const RECOGNITION_LABELS: &str = "labels.txt";
pub const BOXES_ONLY: &str = "result_boxes_only.png";
pub const WITH_LABELS: &str = "result_with_labels.png";
pub const VISUALIZATION: &str = "visualization.png";
/// Subdirectory of the annotated directory holding page copies next to their
/// YOLO labels in directory mode.
pub const DATASET_DIR: &str = "dataset";

const PAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Finds text regions in a page image.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &DynamicImage, options: &DetectionOptions) -> Result<Vec<Detection>>;
}

pub struct PipelineBuilder {
    config: Config,
    threads: Option<usize>,
    cache_path: Option<PathBuf>,
    execution_providers: Vec<ExecutionProvider>,
    detector: Option<Box<dyn Detector>>,
    recognizer: Option<Arc<dyn Recognizer>>,
    load_detector: bool,
    connect_recognizer: bool,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            threads: None,
            cache_path: None,
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
            detector: None,
            recognizer: None,
            load_detector: false,
            connect_recognizer: false,
        }
    }

    /// Overrides `detection.threads` from the config.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    /// Load the ONNX detector named by `paths.model` on build.
    pub fn load_detector(mut self) -> Self {
        self.load_detector = true;
        self
    }

    /// Connect to the recognition service with `paths.credentials` on build.
    pub fn connect_recognizer(mut self) -> Self {
        self.connect_recognizer = true;
        self
    }

    pub fn detector(mut self, detector: impl Detector + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    pub fn recognizer(mut self, recognizer: impl Recognizer + 'static) -> Self {
        self.recognizer = Some(Arc::new(recognizer));
        self
    }

    #[instrument(level = "debug", skip(self))]
    fn init_detector(&mut self) -> Result<YoloNet> {
        let detection = &self.config.detection;
        let model = self.config.model_path()?.to_path_buf();
        log::info!("Loading detector from {}", model.display());
        Ok(YoloNet::init(
            model,
            self.threads.unwrap_or(detection.threads),
            detection.input_size,
            detection.class_names.clone(),
            &self.execution_providers,
            self.cache_path.clone(),
        )?)
    }

    #[instrument(level = "debug", skip(self))]
    fn init_recognizer(&self) -> Result<VisionClient> {
        let recognition = &self.config.recognition;
        VisionClient::new(
            &recognition.endpoint,
            self.config.credentials_path()?,
            recognition.language_hints.clone(),
            Duration::from_secs(recognition.timeout_secs),
        )
    }

    /// Fails before any processing when a requested component cannot be set up.
    #[instrument(skip(self))]
    pub fn build(mut self) -> Result<Pipeline> {
        let detector = match self.detector.take() {
            Some(detector) => Some(detector),
            None if self.load_detector => Some(Box::new(self.init_detector()?) as Box<dyn Detector>),
            None => None,
        };
        let recognizer = match self.recognizer.take() {
            Some(recognizer) => Some(recognizer),
            None if self.connect_recognizer => {
                Some(Arc::new(self.init_recognizer()?) as Arc<dyn Recognizer>)
            }
            None => None,
        };
        let font = match self.config.font_path()? {
            Some(path) => Some(draw::load_font(path)?),
            None => {
                log::debug!("No font configured, pictures carry boxes only");
                None
            }
        };
        Ok(Pipeline {
            config: self.config,
            detector,
            recognizer,
            font,
        })
    }
}

pub struct Pipeline {
    config: Config,
    detector: Option<Box<dyn Detector>>,
    recognizer: Option<Arc<dyn Recognizer>>,
    font: Option<FontArc>,
}

/// Where the detection artifacts of one page are written.
#[derive(Debug, Clone, PartialEq)]
pub struct PageTargets {
    pub crops_dir: PathBuf,
    pub boxes_only: PathBuf,
    pub with_labels: PathBuf,
    pub yolo_labels: PathBuf,
    /// Copy of the page stored next to its YOLO labels.
    pub page_copy: Option<PathBuf>,
}

impl PageTargets {
    /// Fixed artifact names for a single page run.
    pub fn single(paths: &PathsConfig, page_name: &str) -> Self {
        let annotated = &paths.annotated_dir;
        Self {
            crops_dir: paths.crops_dir.clone(),
            boxes_only: annotated.join(BOXES_ONLY),
            with_labels: annotated.join(WITH_LABELS),
            yolo_labels: annotated.join(format!("{page_name}.txt")),
            page_copy: None,
        }
    }

    /// Per-page names, so pages of one directory never share a file. Crops go
    /// to `<crops_dir>/<page>/`, and the page copy plus its labels to
    /// `<annotated_dir>/dataset/`.
    pub fn per_page(paths: &PathsConfig, page_name: &str) -> Self {
        let annotated = &paths.annotated_dir;
        let dataset = annotated.join(DATASET_DIR);
        Self {
            crops_dir: paths.crops_dir.join(page_name),
            boxes_only: annotated.join(format!("{page_name}_boxes_only.png")),
            with_labels: annotated.join(format!("{page_name}_with_labels.png")),
            yolo_labels: dataset.join(format!("{page_name}.txt")),
            page_copy: Some(dataset.join(format!("{page_name}.png"))),
        }
    }
}

/// Totals of a directory detection run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub pages: usize,
    pub failed_pages: usize,
    pub detections: usize,
    pub rejected: usize,
    pub crops_written: usize,
    pub crop_failures: usize,
}

/// Page images directly inside `input_dir`, by file name.
pub fn page_images(input_dir: &Path) -> Result<Vec<PathBuf>> {
    if !input_dir.is_dir() {
        return Err(Error::config(format!(
            "input directory does not exist: {}",
            input_dir.display()
        )));
    }
    let mut pages = std::fs::read_dir(input_dir)
        .map_err(|err| Error::io(input_dir, err))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        PAGE_EXTENSIONS
                            .iter()
                            .any(|known| ext.eq_ignore_ascii_case(known))
                    })
        })
        .collect::<Vec<_>>();
    pages.sort();
    Ok(pages)
}

fn page_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".to_string())
}

/// Detections of one page after validation and ordering.
#[derive(Debug)]
pub struct DetectionOutcome {
    pub ordered: Vec<OrderedDetection>,
    pub rejected: Vec<Error>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub detections: usize,
    pub rejected: usize,
    pub crops_written: usize,
    pub crop_failures: usize,
    pub recognized: usize,
    pub recognition_failures: usize,
}

impl Pipeline {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn font(&self) -> Option<&FontArc> {
        self.font.as_ref()
    }

    fn detector(&self) -> Result<&dyn Detector> {
        self.detector
            .as_deref()
            .ok_or_else(|| Error::config("no detector configured"))
    }

    fn recognizer(&self) -> Result<Arc<dyn Recognizer>> {
        self.recognizer
            .clone()
            .ok_or_else(|| Error::config("no recognizer configured"))
    }

    /// Runs the detector and returns valid regions in reading order.
    #[instrument(skip(self, image))]
    pub fn detect(&self, image: &DynamicImage) -> Result<DetectionOutcome> {
        let detection = &self.config.detection;
        let options = detection.options();
        let raw = self.detector()?.detect(image, &options)?;
        log::info!("Detector returned {} boxes", raw.len());

        let y_threshold = reading_order::row_tolerance(
            options.y_threshold,
            options.y_threshold_ratio,
            image.height(),
        );
        let (ordered, rejected) = reading_order::order_detections(
            raw,
            image.width(),
            image.height(),
            options.min_box_size,
            y_threshold,
        );
        Ok(DetectionOutcome { ordered, rejected })
    }

    /// Detects, orders and crops one page. Writes `processed_results.json`
    /// and the crops to the crop directory, and the outlined pages plus YOLO
    /// labels to the annotated directory.
    pub async fn detect_and_crop(
        &self,
        image: Arc<DynamicImage>,
        page_name: &str,
    ) -> Result<(DetectionOutcome, Vec<ItemOutcome<ExportedCrop, Error>>)> {
        let targets = PageTargets::single(&self.config.paths, page_name);
        self.detect_and_crop_into(image, &targets).await
    }

    #[instrument(skip(self, image))]
    pub async fn detect_and_crop_into(
        &self,
        image: Arc<DynamicImage>,
        targets: &PageTargets,
    ) -> Result<(DetectionOutcome, Vec<ItemOutcome<ExportedCrop, Error>>)> {
        let outcome = self.detect(&image)?;

        let mut dirs = vec![targets.crops_dir.as_path()];
        dirs.extend(
            [&targets.boxes_only, &targets.with_labels, &targets.yolo_labels]
                .into_iter()
                .chain(&targets.page_copy)
                .filter_map(|path| path.parent()),
        );
        for dir in dirs {
            std::fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
        }

        aggregate::write_processed(&targets.crops_dir.join(PROCESSED_RESULTS), &outcome.ordered)?;

        if let Err(err) = draw::draw_detections(&image, &outcome.ordered).save(&targets.boxes_only) {
            log::error!("Failed to save {}: {err}", targets.boxes_only.display());
        }
        let labeled = draw::draw_labeled_detections(&image, &outcome.ordered, self.font());
        if let Err(err) = labeled.save(&targets.with_labels) {
            log::error!("Failed to save {}: {err}", targets.with_labels.display());
        }
        if self.config.detection.write_yolo_labels {
            if let Err(err) = labels::write_yolo_labels(
                &targets.yolo_labels,
                &outcome.ordered,
                image.width(),
                image.height(),
            ) {
                log::error!("Failed to write YOLO labels: {err}");
            }
        }
        if let Some(copy) = &targets.page_copy {
            if let Err(err) = image.save(copy) {
                log::error!("Failed to copy page to {}: {err}", copy.display());
            }
        }

        let crops = cropper::export_crops(
            image,
            &outcome.ordered,
            &targets.crops_dir,
            self.config.recognition.workers,
        )
        .await?;
        Ok((outcome, crops))
    }

    /// Detects and crops every page image in `input_dir`. A page that cannot
    /// be read or processed is logged and skipped.
    #[instrument(skip(self))]
    pub async fn detect_directory(&self, input_dir: &Path) -> Result<BatchSummary> {
        self.detector()?;
        let pages = page_images(input_dir)?;
        if pages.is_empty() {
            log::warn!("No page images in {}", input_dir.display());
        }

        let mut summary = BatchSummary::default();
        for (i, page_path) in pages.iter().enumerate() {
            log::info!("Page {}/{}: {}", i + 1, pages.len(), page_path.display());
            summary.pages += 1;
            let targets = PageTargets::per_page(&self.config.paths, &page_name(page_path));
            let processed = match image::open(page_path) {
                Ok(image) => self.detect_and_crop_into(Arc::new(image), &targets).await,
                Err(err) => Err(err.into()),
            };
            match processed {
                Ok((outcome, crops)) => {
                    summary.detections += outcome.ordered.len();
                    summary.rejected += outcome.rejected.len();
                    let failed = crops.iter().filter(|it| it.result.is_err()).count();
                    summary.crop_failures += failed;
                    summary.crops_written += crops.len() - failed;
                }
                Err(err) => {
                    log::error!("Skipping {}: {err}", page_path.display());
                    summary.failed_pages += 1;
                }
            }
        }
        log::info!(
            "Processed {} pages ({} failed), {} crops written",
            summary.pages,
            summary.failed_pages,
            summary.crops_written
        );
        Ok(summary)
    }

    /// Recognizes every crop on the worker pool. Outcomes are in completion
    /// order.
    #[instrument(skip_all, fields(crops = crops.len()))]
    pub async fn recognize_crops(
        &self,
        crops: &[ExportedCrop],
    ) -> Result<Vec<ItemOutcome<OcrResult, RecognitionError>>> {
        let recognizer = self.recognizer()?;
        let timeout = Duration::from_secs(self.config.recognition.timeout_secs);
        let items = crops
            .iter()
            .map(|crop| (crop.reading_index, crop.clone()))
            .collect::<Vec<_>>();
        Ok(workers::run_bounded(
            items,
            self.config.recognition.workers,
            move |crop: ExportedCrop| {
                let recognizer = recognizer.clone();
                async move { vision_client::recognize_crop(recognizer.as_ref(), &crop, timeout).await }
            },
        )
        .await)
    }

    /// Writes `json_results.json`, the review spreadsheet and the recognition
    /// labels to the output directory.
    #[instrument(skip_all, fields(results = results.len()))]
    pub fn write_reports(&self, results: Vec<OcrResult>, images_dir: &Path) -> Result<Report> {
        let output_dir = &self.config.paths.output_dir;
        std::fs::create_dir_all(output_dir).map_err(|err| Error::io(output_dir, err))?;

        aggregate::write_results(&output_dir.join(JSON_RESULTS), &results)?;
        let report = Report {
            results,
            layout: self.config.report,
        };
        report::write_spreadsheet(&report, images_dir, &output_dir.join(SPREADSHEET))?;
        labels::write_recognition_labels(&output_dir.join(RECOGNITION_LABELS), &report.results)?;
        Ok(report)
    }

    async fn recognize_and_report(
        &self,
        crops: &[ExportedCrop],
        images_dir: &Path,
        summary: &mut RunSummary,
    ) -> Result<Report> {
        let outcomes = self.recognize_crops(crops).await?;
        summary.recognition_failures = outcomes.iter().filter(|it| it.result.is_err()).count()
            + crops.len().saturating_sub(outcomes.len());
        let results = aggregate::merge_outcomes(crops, outcomes);
        summary.recognized = results.iter().filter(|it| it.has_text()).count();
        self.write_reports(results, images_dir)
    }

    /// Whole pipeline for the configured page image.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(Report, RunSummary)> {
        self.recognizer()?;
        let image_path = self.config.image_path()?;
        let page_name = page_name(image_path);
        let image = Arc::new(image::open(image_path)?);
        log::info!(
            "Loaded {} ({}x{})",
            image_path.display(),
            image.width(),
            image.height()
        );

        let (outcome, crop_outcomes) = self.detect_and_crop(image, &page_name).await?;
        let mut summary = RunSummary {
            detections: outcome.ordered.len(),
            rejected: outcome.rejected.len(),
            crop_failures: crop_outcomes.iter().filter(|it| it.result.is_err()).count(),
            ..RunSummary::default()
        };
        let crops = cropper::exported(crop_outcomes);
        summary.crops_written = crops.len();

        let report = self
            .recognize_and_report(&crops, &self.config.paths.crops_dir, &mut summary)
            .await?;
        Ok((report, summary))
    }

    /// Recognizes an existing crop directory described by its
    /// `processed_results.json`.
    #[instrument(skip(self))]
    pub async fn recognize_directory(&self, crops_dir: &Path) -> Result<(Report, RunSummary)> {
        self.recognizer()?;
        if !crops_dir.is_dir() {
            return Err(Error::config(format!(
                "input directory does not exist: {}",
                crops_dir.display()
            )));
        }
        let entries = aggregate::load_processed(&crops_dir.join(PROCESSED_RESULTS))?;
        let crops = entries
            .iter()
            .filter_map(|entry| {
                let ordered = entry.to_ordered();
                let file_name = ordered.crop_file_name();
                let path = crops_dir.join(&file_name);
                match image::image_dimensions(&path) {
                    Ok((width, height)) => Some(ExportedCrop {
                        reading_index: entry.index,
                        file_name,
                        path,
                        coords: entry.coords,
                        size: ImageSize { width, height },
                    }),
                    Err(err) => {
                        log::warn!("Skipping {}: {err}", path.display());
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        if crops.is_empty() {
            return Err(Error::config(format!(
                "no crops found in {}",
                crops_dir.display()
            )));
        }

        let mut summary = RunSummary {
            detections: entries.len(),
            crops_written: crops.len(),
            crop_failures: entries.len() - crops.len(),
            ..RunSummary::default()
        };
        let report = self
            .recognize_and_report(&crops, crops_dir, &mut summary)
            .await?;
        Ok((report, summary))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionOptions {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub y_threshold: i32,
    pub y_threshold_ratio: Option<f32>,
    pub min_box_size: i32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            iou_threshold: 0.45,
            max_detections: 300,
            y_threshold: 30,
            y_threshold_ratio: None,
            min_box_size: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];
