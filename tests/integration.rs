use std::{path::Path, time::Duration};

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use ocrlabel::{
    aggregate,
    vision_client::{Annotation, RecognizedText},
    BoxCoords, Config, Detection, DetectionOptions, Detector, Error, PipelineBuilder,
    RecognitionError, Recognizer, Vertex, DATASET_DIR, JSON_RESULTS, PROCESSED_RESULTS,
    RECOGNITION_LABELS, SPREADSHEET, WITH_LABELS,
};

/// Returns a fixed set of boxes in scrambled order, including one inverted box.
struct FixedDetector;

fn detection(detector_index: usize, coords: BoxCoords) -> Detection {
    Detection {
        detector_index,
        coords,
        class_id: 0,
        class_label: "simple_handwritten".to_string(),
        confidence: 0.87,
        raw_coords: None,
    }
}

impl Detector for FixedDetector {
    fn detect(&self, _image: &DynamicImage, _options: &DetectionOptions) -> ocrlabel::Result<Vec<Detection>> {
        Ok(vec![
            detection(0, BoxCoords::new(100, 105, 160, 135)), // E
            detection(1, BoxCoords::new(200, 12, 250, 42)),   // C
            detection(2, BoxCoords::new(5, 5, 3, 20)),        // inverted
            detection(3, BoxCoords::new(10, 10, 50, 40)),     // A
            detection(4, BoxCoords::new(10, 100, 65, 130)),   // D
            detection(5, BoxCoords::new(100, 15, 145, 45)),   // B
        ])
    }
}

/// Tells crops apart by width. Narrow crops answer last so completion order
/// is the reverse of reading order. The 50 px crop fails.
struct WidthRecognizer;

#[async_trait]
impl Recognizer for WidthRecognizer {
    async fn recognize(&self, image: Vec<u8>) -> Result<RecognizedText, RecognitionError> {
        let crop = image::load_from_memory(&image)
            .map_err(|err| RecognitionError::Input(err.to_string()))?;
        let (w, h) = (crop.width() as i32, crop.height() as i32);
        tokio::time::sleep(Duration::from_millis((70 - w) as u64)).await;
        let text = match w {
            40 => "một",
            45 => "hai",
            55 => "bốn",
            60 => "năm",
            _ => {
                return Err(RecognitionError::Api {
                    code: 8,
                    message: "Resource has been exhausted".to_string(),
                })
            }
        };
        Ok(RecognizedText {
            annotations: vec![Annotation {
                text: text.to_string(),
                vertices: vec![Vertex(1, 1), Vertex(w - 1, 1), Vertex(w - 1, h - 1), Vertex(1, h - 1)],
            }],
        })
    }
}

fn setup(root: &Path) -> Config {
    let page = RgbImage::from_fn(400, 300, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let page_path = root.join("page.png");
    page.save(&page_path).expect("Failed to write page image");

    let mut config = Config::default();
    config.paths.image = Some(page_path);
    config.paths.crops_dir = root.join("imgs");
    config.paths.annotated_dir = root.join("result_images");
    config.paths.output_dir = root.join("ocr_output");
    config
}

#[tokio::test]
async fn one_failed_crop_keeps_every_row() {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = tempfile::tempdir().unwrap();
    let config = setup(root.path());

    let pipeline = PipelineBuilder::new(config.clone())
        .detector(FixedDetector)
        .recognizer(WidthRecognizer)
        .build()
        .expect("Failed to build pipeline");
    let (report, summary) = pipeline.run().await.expect("Pipeline failed");

    assert_eq!(summary.detections, 5);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.crops_written, 5);
    assert_eq!(summary.recognition_failures, 1);
    assert_eq!(summary.recognized, 4);

    let names = report
        .results
        .iter()
        .map(|it| it.image_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            "crop_001_simple_handwritten.png",
            "crop_002_simple_handwritten.png",
            "crop_003_simple_handwritten.png",
            "crop_004_simple_handwritten.png",
            "crop_005_simple_handwritten.png",
        ]
    );
    let texts = report
        .results
        .iter()
        .map(|it| it.full_text.as_str())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["một", "hai", "", "bốn", "năm"]);

    let failed = &report.results[2];
    assert!(failed.text_blocks.is_empty());
    assert_eq!(failed.original_crop_coords, Some(BoxCoords::new(200, 12, 250, 42)));
    assert_eq!(failed.image_size.width, 50);

    let second = &report.results[1];
    assert_eq!(second.original_crop_coords, Some(BoxCoords::new(100, 15, 145, 45)));
    assert_eq!(second.text_blocks[0].position.vertices[0], Vertex(101, 16));
    assert_eq!(second.text_blocks[0].position.relative_vertices[0], Vertex(1, 1));

    let crops_dir = &config.paths.crops_dir;
    let processed = aggregate::load_processed(&crops_dir.join(PROCESSED_RESULTS)).unwrap();
    let indices = processed.iter().map(|it| it.index).collect::<Vec<_>>();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert_eq!(processed[0].coords, BoxCoords::new(10, 10, 50, 40));

    let output_dir = &config.paths.output_dir;
    let stored = aggregate::load_results(&output_dir.join(JSON_RESULTS)).unwrap();
    assert_eq!(stored, report.results);
    assert!(output_dir.join(SPREADSHEET).is_file());
    let labels = std::fs::read_to_string(output_dir.join(RECOGNITION_LABELS)).unwrap();
    assert_eq!(labels.lines().count(), 4);

    assert!(config.paths.annotated_dir.join("result_boxes_only.png").is_file());
    assert!(config.paths.annotated_dir.join(WITH_LABELS).is_file());
    let yolo = std::fs::read_to_string(config.paths.annotated_dir.join("page.txt")).unwrap();
    assert_eq!(yolo.lines().count(), 5);
}

#[tokio::test]
async fn recognizes_an_existing_crop_directory() {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = tempfile::tempdir().unwrap();
    let config = setup(root.path());

    let detect_only = PipelineBuilder::new(config.clone())
        .detector(FixedDetector)
        .build()
        .unwrap();
    let page = image::open(config.paths.image.as_ref().unwrap()).unwrap();
    let (outcome, crops) = detect_only
        .detect_and_crop(std::sync::Arc::new(page), "page")
        .await
        .unwrap();
    assert_eq!(outcome.ordered.len(), 5);
    assert_eq!(crops.len(), 5);

    let mut config = config;
    config.paths.output_dir = root.path().join("second_pass");
    let recognize_only = PipelineBuilder::new(config.clone())
        .recognizer(WidthRecognizer)
        .build()
        .unwrap();
    let (report, summary) = recognize_only
        .recognize_directory(&config.paths.crops_dir)
        .await
        .unwrap();

    assert_eq!(summary.crops_written, 5);
    assert_eq!(report.results.len(), 5);
    assert_eq!(report.results[3].full_text, "bốn");
    assert_eq!(report.results[3].original_crop_coords, Some(BoxCoords::new(10, 100, 65, 130)));
    assert!(config.paths.output_dir.join(JSON_RESULTS).is_file());
}

#[tokio::test]
async fn missing_recognizer_fails_before_processing() {
    let root = tempfile::tempdir().unwrap();
    let config = setup(root.path());

    let pipeline = PipelineBuilder::new(config.clone())
        .detector(FixedDetector)
        .build()
        .unwrap();
    let err = pipeline.run().await.unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert!(!config.paths.crops_dir.exists());
}

#[tokio::test]
async fn missing_credentials_fail_the_build() {
    let root = tempfile::tempdir().unwrap();
    let mut config = setup(root.path());
    config.paths.credentials = Some(root.path().join("credentials.json"));

    let result = PipelineBuilder::new(config).connect_recognizer().build();
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn missing_crop_directory_is_a_configuration_error() {
    let root = tempfile::tempdir().unwrap();
    let config = setup(root.path());

    let pipeline = PipelineBuilder::new(config)
        .recognizer(WidthRecognizer)
        .build()
        .unwrap();
    let err = pipeline
        .recognize_directory(&root.path().join("nowhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn directory_mode_keeps_pages_apart() {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = tempfile::tempdir().unwrap();
    let config = setup(root.path());
    let input_dir = root.path().join("pages");
    std::fs::create_dir(&input_dir).unwrap();
    let page = image::open(root.path().join("page.png")).unwrap();
    page.save(input_dir.join("19.png")).unwrap();
    page.save(input_dir.join("20.JPG")).unwrap();
    std::fs::write(input_dir.join("21.jpeg"), b"not an image").unwrap();
    std::fs::write(input_dir.join("notes.txt"), b"ignored").unwrap();

    let pipeline = PipelineBuilder::new(config.clone())
        .detector(FixedDetector)
        .build()
        .unwrap();
    let summary = pipeline.detect_directory(&input_dir).await.unwrap();

    assert_eq!(summary.pages, 3);
    assert_eq!(summary.failed_pages, 1);
    assert_eq!(summary.detections, 10);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.crops_written, 10);
    assert_eq!(summary.crop_failures, 0);

    let crops_dir = &config.paths.crops_dir;
    for page in ["19", "20"] {
        let page_crops = crops_dir.join(page);
        assert!(page_crops.join("crop_001_simple_handwritten.png").is_file());
        assert_eq!(aggregate::load_processed(&page_crops.join(PROCESSED_RESULTS)).unwrap().len(), 5);
    }
    assert!(!crops_dir.join("21").join(PROCESSED_RESULTS).exists());

    let annotated = &config.paths.annotated_dir;
    let dataset = annotated.join(DATASET_DIR);
    let yolo = std::fs::read_to_string(dataset.join("19.txt")).unwrap();
    assert_eq!(yolo.lines().count(), 5);
    assert!(dataset.join("19.png").is_file());
    assert!(dataset.join("20.png").is_file());
    assert!(annotated.join("19_boxes_only.png").is_file());
    assert!(annotated.join("20_with_labels.png").is_file());
}

#[tokio::test]
async fn directory_mode_needs_a_detector() {
    let root = tempfile::tempdir().unwrap();
    let config = setup(root.path());

    let pipeline = PipelineBuilder::new(config).build().unwrap();
    let err = pipeline.detect_directory(root.path()).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}
