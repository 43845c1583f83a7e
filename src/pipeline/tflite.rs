use std::path::Path;
use std::sync::Mutex;

use tflite::ops::builtin::BuiltinOpResolver;
use tflite::context::ElementKind;
use tflite::{FlatBufferModel, Interpreter, InterpreterBuilder};

use super::postprocess::{
    candidates_from_proposals, decode_grid, filter_proposals, grid_classes, label_candidates, nms,
    REGION_PROPOSAL_LABELS,
};
use super::preprocess::{resize_square, to_nchw, to_nhwc, Normalization};
use super::{BackendError, BackendKind, DetectOptions, Detections, Detector, InferenceError, LabelMap};
use crate::app::config::ModelConfig;
use crate::codec::Bitmap;

/// One interpreter plus its input geometry. Only float models are served.
///
/// The interpreter is not reentrant, so every call takes the lock: one
/// inference at a time per backend, whatever the number of sessions.
struct TFLiteStage<'a> {
    name: String,
    interpreter: Mutex<Interpreter<'a, BuiltinOpResolver>>,
    size: u32,
    planar: bool,
    output_dims: Vec<Vec<usize>>,
}

impl<'a> TFLiteStage<'a> {
    fn new(kind: BackendKind, config: &ModelConfig) -> Result<Self, BackendError> {
        let load_err = |message: String| BackendError::Load {
            kind,
            model: config.model_filename.clone(),
            message,
        };
        let model = FlatBufferModel::build_from_file(&config.model_filename)
            .map_err(|err| load_err(err.to_string()))?;
        let resolver = BuiltinOpResolver::default();
        let builder = InterpreterBuilder::new(model, resolver).map_err(|err| load_err(err.to_string()))?;
        let mut interpreter = builder.build().map_err(|err| load_err(err.to_string()))?;
        interpreter
            .allocate_tensors()
            .map_err(|err| load_err(err.to_string()))?;
        if config.num_threads > 0 {
            interpreter.set_num_threads(config.num_threads as i32);
        }

        let details = interpreter
            .get_input_details()
            .map_err(|err| load_err(err.to_string()))?;
        let input = details
            .first()
            .ok_or_else(|| load_err("model has no input tensor".to_string()))?;
        if input.dims.len() != 4 {
            return Err(load_err(format!("expected a 4-d input, got {:?}", input.dims)));
        }
        // [1, 3, H, W] or [1, H, W, 3]
        let planar = input.dims[1] == 3;
        let (height, width) = if planar {
            (input.dims[2], input.dims[3])
        } else {
            (input.dims[1], input.dims[2])
        };
        if height != width || width as u32 != config.input_size {
            return Err(load_err(format!(
                "model input is {width}x{height}, configured input_size is {}",
                config.input_size
            )));
        }
        require_float("input", &input.name, &input.element_kind).map_err(load_err)?;

        let outputs = interpreter
            .get_output_details()
            .map_err(|err| load_err(err.to_string()))?;
        for output in &outputs {
            require_float("output", &output.name, &output.element_kind).map_err(load_err)?;
        }
        let output_dims = outputs.into_iter().map(|output| output.dims).collect();

        tracing::info!(%kind, size = width, planar, ?output_dims, "interpreter ready");
        Ok(Self {
            name: kind.to_string(),
            interpreter: Mutex::new(interpreter),
            size: config.input_size,
            planar,
            output_dims,
        })
    }

    fn error(&self, message: impl std::fmt::Display) -> InferenceError {
        InferenceError::new(&self.name, message)
    }

    /// Resize, fill the input tensor, invoke, then hand every output tensor
    /// to `read`.
    fn run<T>(
        &self,
        bitmap: &Bitmap,
        norm: &Normalization,
        read: impl FnOnce(&[&[f32]]) -> T,
    ) -> Result<T, InferenceError> {
        let resized = resize_square(bitmap, self.size);
        let mut interpreter = self
            .interpreter
            .lock()
            .map_err(|_| self.error("interpreter lock poisoned"))?;

        let input_index = interpreter.inputs()[0];
        let data = if self.planar {
            to_nchw(&resized, norm)
        } else {
            to_nhwc(&resized, norm)
        };
        let tensor = interpreter
            .tensor_data_mut::<f32>(input_index)
            .map_err(|err| self.error(err))?;
        if tensor.len() != data.len() {
            return Err(self.error(format!(
                "input tensor holds {} values, frame has {}",
                tensor.len(),
                data.len()
            )));
        }
        tensor.copy_from_slice(&data);

        interpreter.invoke().map_err(|err| self.error(err))?;

        let outputs = interpreter.outputs().to_vec();
        let mut tensors = Vec::with_capacity(outputs.len());
        for index in outputs {
            tensors.push(interpreter.tensor_data::<f32>(index).map_err(|err| self.error(err))?);
        }
        Ok(read(&tensors))
    }
}

/// Quantized models take a different input layout and scaling; they are
/// refused at load time.
fn require_float(role: &str, name: &str, element_kind: &ElementKind) -> Result<(), String> {
    if matches!(element_kind, ElementKind::kTfLiteFloat32) {
        Ok(())
    } else {
        Err(format!(
            "{role} tensor {name} is {element_kind:?}, only float32 models are supported"
        ))
    }
}

/// Two-stage detector exported with the detection-postprocess head: outputs
/// are boxes, classes, scores and a count.
pub struct RegionProposalStage {
    stage: TFLiteStage<'static>,
    class_offset: i32,
}

impl RegionProposalStage {
    pub fn new(config: &ModelConfig) -> Result<Self, BackendError> {
        Ok(Self {
            stage: TFLiteStage::new(BackendKind::RegionProposal, config)?,
            class_offset: config.class_offset,
        })
    }
}

impl Detector for RegionProposalStage {
    fn name(&self) -> &str {
        &self.stage.name
    }

    fn detect(&self, bitmap: &Bitmap, options: &DetectOptions) -> Result<Detections, InferenceError> {
        let size = self.stage.size as f32;
        let candidates = self
            .stage
            .run(bitmap, &Normalization::REGION_PROPOSAL, |outputs| {
                if outputs.len() < 4 {
                    return Err(outputs.len());
                }
                let count = outputs[3].first().copied().unwrap_or(0.0) as usize;
                Ok(candidates_from_proposals(
                    outputs[0], outputs[1], outputs[2], count, size, size,
                ))
            })?
            .map_err(|found| self.stage.error(format!("expected 4 output tensors, got {found}")))?;
        Ok(filter_proposals(
            candidates,
            options.confidence,
            &REGION_PROPOSAL_LABELS,
            self.class_offset,
        ))
    }
}

/// Single-stage grid detector with a `[1, 4 + classes, anchors]` output and
/// boxes normalized to the input size.
pub struct SingleStageStage {
    stage: TFLiteStage<'static>,
    labels: LabelMap,
    num_classes: usize,
}

impl SingleStageStage {
    pub fn new(config: &ModelConfig) -> Result<Self, BackendError> {
        let load_err = |message: String| BackendError::Load {
            kind: BackendKind::SingleStage,
            model: config.model_filename.clone(),
            message,
        };
        let stage = TFLiteStage::new(BackendKind::SingleStage, config)?;
        let path = config
            .label_filename
            .as_deref()
            .ok_or_else(|| load_err("single-stage backend needs a label_filename".to_string()))?;
        let labels = LabelMap::from_file(Path::new(path)).map_err(|err| load_err(err.to_string()))?;
        let dims = stage
            .output_dims
            .first()
            .ok_or_else(|| load_err("model has no output tensor".to_string()))?;
        let num_classes = grid_classes(dims, &labels).map_err(|err| load_err(err.to_string()))?;
        tracing::debug!(num_classes, labels = labels.len(), "grid output checked");
        Ok(Self {
            stage,
            labels,
            num_classes,
        })
    }
}

impl Detector for SingleStageStage {
    fn name(&self) -> &str {
        &self.stage.name
    }

    fn detect(&self, bitmap: &Bitmap, options: &DetectOptions) -> Result<Detections, InferenceError> {
        let size = self.stage.size as f32;
        let candidates = self
            .stage
            .run(bitmap, &Normalization::UNIT, |outputs| {
                let grid = outputs.first().copied().unwrap_or_default();
                decode_grid(grid, self.num_classes, options.confidence, size)
            })?
            .map_err(|err| self.stage.error(err))?;
        let kept = match options.iou {
            Some(iou) => nms(candidates, iou),
            None => candidates,
        };
        Ok(label_candidates(kept, &self.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_float() {
        assert!(require_float("input", "images", &ElementKind::kTfLiteFloat32).is_ok());
        let err = require_float("input", "images", &ElementKind::kTfLiteUInt8).unwrap_err();
        assert!(err.contains("only float32"), "{err}");
        assert!(require_float("output", "scores", &ElementKind::kTfLiteInt8).is_err());
    }

    #[test]
    fn test_missing_model_is_a_load_error() {
        let config = ModelConfig::new("missing/model.tflite");
        assert!(matches!(
            RegionProposalStage::new(&config),
            Err(BackendError::Load {
                kind: BackendKind::RegionProposal,
                ..
            })
        ));
    }
}
