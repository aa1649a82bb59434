use std::path::PathBuf;

use float_ord::FloatOrd;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{ArrayView2, Axis, Ix2};
use ort::{inputs, ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::{
    util::{self, non_max_suppression, normalized_chw, scale_to_square, Candidate},
    Detection, DetectionOptions, Detector, Error, ExecutionProvider, Result,
};

/// Single-stage region detector exported in the YOLO layout: one output of
/// shape `[1, 4 + classes, candidates]` holding centre-x, centre-y, width and
/// height followed by one score per class.
pub struct YoloNet {
    session: Session,
    input_size: u32,
    class_names: Vec<String>,
}

#[cfg(feature = "tensorrt")]
fn setup_tensorrt(cache_path: PathBuf, input_size: u32) -> ExecutionProviderDispatch {
    use ort::TensorRTExecutionProvider;

    let shape = format!("images:1x3x{input_size}x{input_size}");
    TensorRTExecutionProvider::default()
        .with_profile_min_shapes(shape.clone())
        .with_profile_max_shapes(shape.clone())
        .with_profile_opt_shapes(shape)
        .with_engine_cache(true)
        .with_engine_cache_path(cache_path.to_string_lossy())
        .with_timing_cache(true)
        .build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

impl YoloNet {
    #[instrument(level = "debug", skip(class_names))]
    pub fn init(
        path: PathBuf,
        num_threads: usize,
        input_size: u32,
        class_names: Vec<String>,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<PathBuf>,
    ) -> ort::Result<Self> {
        #[cfg(feature = "directml")]
        let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
        #[cfg(not(feature = "directml"))]
        let parallel = true;

        let execution_providers = execution_providers.iter().filter_map(
            |provider| -> Option<ExecutionProviderDispatch> {
                match provider {
                    ExecutionProvider::Default => None,
                    #[cfg(feature = "tensorrt")]
                    ExecutionProvider::TensorRT => Some(setup_tensorrt(
                        cache_path.clone().unwrap_or_else(|| {
                            path.parent()
                                .map(|dir| dir.join(".cache"))
                                .unwrap_or_else(|| PathBuf::from(".cache"))
                        }),
                        input_size,
                    )),
                    #[cfg(feature = "coreml")]
                    ExecutionProvider::CoreML => Some(setup_coreml()),
                    #[cfg(feature = "cuda")]
                    ExecutionProvider::Cuda => Some(setup_cuda()),
                    #[cfg(feature = "directml")]
                    ExecutionProvider::DirectML => Some(setup_directml()),
                }
            },
        );
        #[cfg(not(feature = "tensorrt"))]
        let _ = &cache_path;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_memory_pattern(parallel)?
            .with_parallel_execution(parallel)?
            .with_inter_threads(num_threads)?
            .with_intra_threads(num_threads)?
            .with_execution_providers(execution_providers)?
            .commit_from_file(path)?;

        log::debug!("Detector inputs: {:?}", session.inputs);
        log::debug!("Detector outputs: {:?}", session.outputs);

        Ok(Self {
            session,
            input_size,
            class_names,
        })
    }

    fn class_label(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

impl Detector for YoloNet {
    #[instrument(skip(self, image, options), level = "debug")]
    fn detect(&self, image: &DynamicImage, options: &DetectionOptions) -> Result<Vec<Detection>> {
        let scale = scale_to_square(image, self.input_size);
        let resized =
            image.resize_exact(scale.target_width, scale.target_height, FilterType::Triangle);
        #[cfg(feature = "debug")]
        resized.save("detector_input.png")?;

        let input_values = normalized_chw(&resized).insert_axis(Axis(0));
        let input_name = self
            .session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());
        let outputs = self
            .session
            .run(inputs![input_name.as_str() => input_values]?)?;
        let predictions = outputs
            .first_key_value()
            .ok_or_else(|| Error::ModelOutput("detector produced no outputs".to_string()))?
            .1
            .try_extract_tensor::<f32>()?;
        log::trace!("Detector output shape: {:?}", predictions.shape());

        let predictions = predictions
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|err| Error::ModelOutput(err.to_string()))?;

        let candidates = decode_predictions(predictions, scale, options.confidence_threshold)?;
        let kept =
            non_max_suppression(candidates, options.iou_threshold, options.max_detections);
        log::debug!("Detector kept {} boxes after suppression", kept.len());

        Ok(kept
            .into_iter()
            .enumerate()
            .map(|(detector_index, candidate)| Detection {
                detector_index,
                coords: candidate.coords(),
                class_id: candidate.class_id,
                class_label: self.class_label(candidate.class_id),
                confidence: candidate.score,
                raw_coords: Some([candidate.x1, candidate.y1, candidate.x2, candidate.y2]),
            })
            .collect())
    }
}

/// Turns the `[4 + classes, candidates]` prediction matrix into boxes in
/// source image space, dropping candidates below `confidence_threshold`.
#[instrument(skip(predictions), level = "trace")]
pub(crate) fn decode_predictions(
    predictions: ArrayView2<f32>,
    util::Scale {
        factor_x, factor_y, ..
    }: util::Scale,
    confidence_threshold: f32,
) -> Result<Vec<Candidate>> {
    if predictions.nrows() < 5 {
        return Err(Error::ModelOutput(format!(
            "expected at least 5 rows per candidate, got {}",
            predictions.nrows()
        )));
    }

    Ok(predictions
        .columns()
        .into_iter()
        .filter_map(|column| {
            let (class_id, score) = column
                .iter()
                .skip(4)
                .enumerate()
                .max_by_key(|(_, score)| FloatOrd(**score))
                .map(|(class_id, score)| (class_id, *score))?;
            if score < confidence_threshold {
                return None;
            }
            let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
            Some(Candidate {
                x1: (cx - w / 2.0) * factor_x,
                y1: (cy - h / 2.0) * factor_y,
                x2: (cx + w / 2.0) * factor_x,
                y2: (cy + h / 2.0) * factor_y,
                class_id,
                score,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn decodes_centre_boxes_into_source_space() {
        // Two candidates, two classes.
        let predictions = array![
            [100.0, 300.0],
            [50.0, 300.0],
            [40.0, 20.0],
            [20.0, 20.0],
            [0.1, 0.2],
            [0.8, 0.1],
        ];
        let scale = util::Scale {
            factor_x: 2.0,
            factor_y: 0.5,
            target_width: 640,
            target_height: 640,
        };
        let candidates = decode_predictions(predictions.view(), scale, 0.3).unwrap();
        assert_eq!(candidates.len(), 1);
        let candidate = candidates[0];
        assert_eq!(candidate.class_id, 1);
        assert_eq!(candidate.score, 0.8);
        assert_eq!(
            (candidate.x1, candidate.y1, candidate.x2, candidate.y2),
            (160.0, 20.0, 240.0, 30.0)
        );
    }

    #[test]
    fn rejects_truncated_output() {
        let predictions = array![[1.0], [2.0], [3.0], [4.0]];
        let scale = util::Scale {
            factor_x: 1.0,
            factor_y: 1.0,
            target_width: 640,
            target_height: 640,
        };
        assert!(matches!(
            decode_predictions(predictions.view(), scale, 0.3),
            Err(Error::ModelOutput(_))
        ));
    }
}
