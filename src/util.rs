use float_ord::FloatOrd;
use geo::{Centroid, Coord, LineString, MultiPoint, Point, Translate};
use image::{DynamicImage, Pixel};
use ndarray::Array3;
use tracing::instrument;

use crate::{BoxCoords, Center, Vertex};

/// CHW float tensor with channels scaled to `[0, 1]`.
#[instrument(level = "debug", skip(image))]
pub(crate) fn normalized_chw(image: &DynamicImage) -> Array3<f32> {
    let image = image.to_rgb32f();
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

#[derive(Debug, Clone, Copy)]
pub struct Scale {
    pub factor_x: f32,
    pub factor_y: f32,
    pub target_width: u32,
    pub target_height: u32,
}

/// Scale for stretching an image onto a square detector input.
pub fn scale_to_square(image: &DynamicImage, target_size: u32) -> Scale {
    let scale = Scale {
        target_width: target_size,
        target_height: target_size,
        factor_x: image.width() as f32 / target_size as f32,
        factor_y: image.height() as f32 / target_size as f32,
    };
    log::debug!(
        "Resize will change image dimensions from (w: {}, h: {}) to (w: {target_size}, h: {target_size}) with scaling factor ({}, {}).",
        image.width(),
        image.height(),
        scale.factor_x,
        scale.factor_y
    );
    scale
}

/// Candidate box in source image space before suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class_id: usize,
    pub score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub(crate) fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let intersection = w * h;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Truncates toward zero like an integer cast of the detector output.
    pub(crate) fn coords(&self) -> BoxCoords {
        BoxCoords::new(self.x1 as i32, self.y1 as i32, self.x2 as i32, self.y2 as i32)
    }
}

/// Class-aware greedy non-maximum suppression. Survivors keep descending
/// score order.
#[instrument(level = "trace", skip(candidates))]
pub(crate) fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by_key(|it| std::cmp::Reverse(FloatOrd(it.score)));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|it| it.class_id == candidate.class_id && it.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

pub(crate) fn crop_region(image: &DynamicImage, coords: &BoxCoords) -> DynamicImage {
    let x = (coords.x1.max(0) as u32).min(image.width());
    let y = (coords.y1.max(0) as u32).min(image.height());
    let width = (coords.width().max(0) as u32).min(image.width() - x);
    let height = (coords.height().max(0) as u32).min(image.height() - y);
    log::trace!("Slicing subimage to {coords:?}");
    image.crop_imm(x, y, width, height)
}

/// Moves crop-local vertices into source image space.
pub(crate) fn offset_vertices(vertices: &[Vertex], dx: i32, dy: i32) -> Vec<Vertex> {
    let line: LineString<i32> = vertices
        .iter()
        .map(|Vertex(x, y)| Coord { x: *x, y: *y })
        .collect();
    line.translate(dx, dy)
        .into_inner()
        .into_iter()
        .map(|coord| Vertex(coord.x, coord.y))
        .collect()
}

/// Mean of the vertices.
pub(crate) fn vertex_center(vertices: &[Vertex]) -> Center {
    let points: MultiPoint<f64> = vertices
        .iter()
        .map(|Vertex(x, y)| Point::new(f64::from(*x), f64::from(*y)))
        .collect();
    points
        .centroid()
        .map(|point| Center {
            x: point.x(),
            y: point.y(),
        })
        .unwrap_or(Center { x: 0.0, y: 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize, score: f32) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            class_id,
            score,
        }
    }

    #[test]
    fn overlapping_same_class_boxes_are_suppressed() {
        let kept = non_max_suppression(
            vec![
                candidate(0.0, 0.0, 10.0, 10.0, 0, 0.6),
                candidate(1.0, 1.0, 11.0, 11.0, 0, 0.9),
                candidate(1.0, 1.0, 11.0, 11.0, 1, 0.5),
                candidate(50.0, 50.0, 60.0, 60.0, 0, 0.4),
            ],
            0.45,
            300,
        );
        let scores = kept.iter().map(|it| it.score).collect::<Vec<_>>();
        assert_eq!(scores, vec![0.9, 0.5, 0.4]);
    }

    #[test]
    fn suppression_respects_max_detections() {
        let kept = non_max_suppression(
            (0..10)
                .map(|i| candidate(i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0, 0, 0.5))
                .collect(),
            0.45,
            3,
        );
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 0, 1.0);
        let b = candidate(20.0, 20.0, 30.0, 30.0, 0, 1.0);
        assert_eq!(a.iou(&b), 0.0);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn offsets_every_vertex_exactly() {
        let raw = vec![Vertex(0, 0), Vertex(17, 0), Vertex(17, 9), Vertex(0, 9)];
        let moved = offset_vertices(&raw, 120, 45);
        assert_eq!(
            moved,
            vec![Vertex(120, 45), Vertex(137, 45), Vertex(137, 54), Vertex(120, 54)]
        );
    }

    #[test]
    fn center_is_vertex_mean() {
        let center = vertex_center(&[Vertex(0, 0), Vertex(10, 0), Vertex(10, 5), Vertex(0, 5)]);
        assert_eq!(center, Center { x: 5.0, y: 2.5 });
        assert_eq!(vertex_center(&[]), Center { x: 0.0, y: 0.0 });
    }

    #[test]
    fn crop_is_clamped_to_image() {
        let image = DynamicImage::new_rgb8(50, 40);
        let crop = crop_region(&image, &BoxCoords::new(30, 20, 80, 90));
        assert_eq!((crop.width(), crop.height()), (20, 20));
    }
}
