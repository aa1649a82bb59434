use tracing::instrument;

use crate::{Detection, Error, OrderedDetection, Rejection};

/// Checks that a detection lies inside a `width` x `height` image and spans at
/// least `min_size` pixels on both axes.
pub fn validate_box(
    detection: &Detection,
    width: u32,
    height: u32,
    min_size: i32,
) -> Result<(), Rejection> {
    let c = detection.coords;
    if c.x1 >= c.x2 || c.y1 >= c.y2 {
        return Err(Rejection::Inverted);
    }
    if c.x1 < 0 || c.y1 < 0 || i64::from(c.x2) > i64::from(width) || i64::from(c.y2) > i64::from(height)
    {
        return Err(Rejection::OutOfBounds);
    }
    if c.width() < min_size || c.height() < min_size {
        return Err(Rejection::TooSmall);
    }
    Ok(())
}

/// Splits detections into valid ones and rejections, preserving detector order.
pub fn partition_valid(
    detections: Vec<Detection>,
    width: u32,
    height: u32,
    min_size: i32,
) -> (Vec<Detection>, Vec<Error>) {
    let mut kept = Vec::with_capacity(detections.len());
    let mut rejected = Vec::new();
    for detection in detections {
        match validate_box(&detection, width, height, min_size) {
            Ok(()) => kept.push(detection),
            Err(reason) => {
                log::warn!(
                    "Skipping invalid box {:?} ({reason})",
                    <[i32; 4]>::from(detection.coords)
                );
                rejected.push(Error::InvalidDetection {
                    coords: detection.coords,
                    reason,
                });
            }
        }
    }
    (kept, rejected)
}

/// Orders detections row by row, left to right within a row.
///
/// A detection joins the current row while its centre lies within
/// `y_threshold` pixels of the centre of the row's first member. Both sorts
/// are stable, so ties keep their incoming order.
pub fn sort_reading_order(mut detections: Vec<Detection>, y_threshold: i32) -> Vec<Detection> {
    detections.sort_by_key(|it| it.center().1);

    let mut rows: Vec<Vec<Detection>> = Vec::new();
    for detection in detections {
        match rows.last_mut() {
            Some(row)
                if (detection.center().1 - row[0].center().1).abs()
                    <= y_threshold =>
            {
                row.push(detection)
            }
            _ => rows.push(vec![detection]),
        }
    }

    rows.into_iter()
        .flat_map(|mut row| {
            row.sort_by_key(|it| it.center().0);
            row
        })
        .collect()
}

/// Row tolerance for an image of the given height.
pub fn row_tolerance(y_threshold: i32, y_threshold_ratio: Option<f32>, height: u32) -> i32 {
    match y_threshold_ratio {
        Some(ratio) => ((height as f32 * ratio).round() as i32).max(1),
        None => y_threshold,
    }
}

/// Validates, sorts and numbers detections from 1 in reading order.
#[instrument(level = "debug", skip(detections))]
pub fn order_detections(
    detections: Vec<Detection>,
    width: u32,
    height: u32,
    min_size: i32,
    y_threshold: i32,
) -> (Vec<OrderedDetection>, Vec<Error>) {
    let (valid, rejected) = partition_valid(detections, width, height, min_size);
    let ordered = sort_reading_order(valid, y_threshold)
        .into_iter()
        .enumerate()
        .map(|(i, detection)| OrderedDetection {
            reading_index: i + 1,
            detection,
        })
        .collect::<Vec<_>>();
    log::debug!(
        "Ordered {} detections, rejected {}",
        ordered.len(),
        rejected.len()
    );
    (ordered, rejected)
}
