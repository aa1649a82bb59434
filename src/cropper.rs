use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use image::DynamicImage;
use tracing::instrument;

use crate::{
    util::crop_region, workers::run_bounded, Error, ExportedCrop, ImageSize, ItemOutcome,
    OrderedDetection, Result,
};

/// Writes one PNG per detection into `output_dir`, named after its reading
/// index and class. A failed crop is reported in its outcome and does not stop
/// the others. Only failing to create `output_dir` is fatal.
#[instrument(level = "debug", skip(image, detections))]
pub async fn export_crops(
    image: Arc<DynamicImage>,
    detections: &[OrderedDetection],
    output_dir: &Path,
    workers: usize,
) -> Result<Vec<ItemOutcome<ExportedCrop, Error>>> {
    std::fs::create_dir_all(output_dir).map_err(|err| Error::io(output_dir, err))?;

    let items = detections
        .iter()
        .map(|it| (it.reading_index, it.clone()))
        .collect::<Vec<_>>();
    let output_dir = output_dir.to_path_buf();
    let outcomes = run_bounded(items, workers, move |detection: OrderedDetection| {
        let image = image.clone();
        let path = output_dir.join(detection.crop_file_name());
        async move {
            tokio::task::spawn_blocking(move || write_crop(&image, &detection, path))
                .await
                .map_err(|err| Error::Worker(err.to_string()))?
        }
    })
    .await;

    for outcome in &outcomes {
        if let Err(err) = &outcome.result {
            log::error!("Crop {} failed: {err}", outcome.reading_index);
        }
    }
    Ok(outcomes)
}

fn write_crop(
    image: &DynamicImage,
    detection: &OrderedDetection,
    path: PathBuf,
) -> Result<ExportedCrop> {
    let coords = detection.detection.coords;
    let crop = crop_region(image, &coords);
    crop.save(&path).map_err(|err| match err {
        image::ImageError::IoError(source) => Error::io(&path, source),
        other => Error::Image(other),
    })?;
    log::debug!(
        "{}. {}: {:.1}% - [{}, {}, {}, {}] -> {}",
        detection.reading_index,
        detection.detection.class_label,
        detection.detection.confidence * 100.0,
        coords.x1,
        coords.y1,
        coords.x2,
        coords.y2,
        path.display()
    );
    Ok(ExportedCrop {
        reading_index: detection.reading_index,
        file_name: detection.crop_file_name(),
        path,
        coords,
        size: ImageSize {
            width: crop.width(),
            height: crop.height(),
        },
    })
}

/// Successful crops in reading order.
pub fn exported<E>(outcomes: Vec<ItemOutcome<ExportedCrop, E>>) -> Vec<ExportedCrop> {
    let mut crops = outcomes
        .into_iter()
        .filter_map(|it| it.result.ok())
        .collect::<Vec<_>>();
    crops.sort_by_key(|it| it.reading_index);
    crops
}
