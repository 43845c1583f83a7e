mod labels;
pub use labels::LabelMap;

pub mod postprocess;
pub mod preprocess;

#[cfg(feature = "tflite")]
mod tflite;
#[cfg(feature = "tflite")]
pub use tflite::{RegionProposalStage, SingleStageStage};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::config::{BackendsConfig, ModelConfig};
use crate::codec::Bitmap;

/// One detected region. Coordinates are in the backend's input pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub label: String,
    pub score: f32,
}

pub type Detections = Vec<DetectionBox>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    pub confidence: f32,
    pub iou: Option<f32>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{backend} inference failed: {message}")]
pub struct InferenceError {
    pub backend: String,
    pub message: String,
}

impl InferenceError {
    pub fn new(backend: &str, message: impl fmt::Display) -> Self {
        Self {
            backend: backend.to_string(),
            message: message.to_string(),
        }
    }
}

/// The one capability every backend exposes.
///
/// Implementations are shared by all sessions at once. A runtime that is not
/// reentrant must serialize calls itself.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, bitmap: &Bitmap, options: &DetectOptions) -> Result<Detections, InferenceError>;
}

pub type BackendHandle = Arc<dyn Detector>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    RegionProposal,
    SingleStage,
}

impl BackendKind {
    pub fn default_options(self) -> DetectOptions {
        match self {
            BackendKind::RegionProposal => DetectOptions {
                confidence: 0.5,
                iou: None,
            },
            BackendKind::SingleStage => DetectOptions {
                confidence: 0.25,
                iou: Some(0.45),
            },
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendKind::RegionProposal => write!(f, "region_proposal"),
            BackendKind::SingleStage => write!(f, "single_stage"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{kind} backend could not be loaded from {model}: {message}")]
    Load {
        kind: BackendKind,
        model: String,
        message: String,
    },
    #[error("{0} backend is configured but this build lacks the `tflite` feature")]
    Unsupported(BackendKind),
}

/// Process-wide detector handles, loaded once at startup.
#[derive(Clone, Default)]
pub struct Backends {
    handles: HashMap<BackendKind, BackendHandle>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: BackendKind, handle: BackendHandle) -> Self {
        self.handles.insert(kind, handle);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<&BackendHandle> {
        self.handles.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn load(config: &BackendsConfig) -> Result<Self, BackendError> {
        let mut backends = Self::new();
        if let Some(model) = &config.region_proposal {
            let handle = load_backend(BackendKind::RegionProposal, model)?;
            backends = backends.with(BackendKind::RegionProposal, handle);
        }
        if let Some(model) = &config.single_stage {
            let handle = load_backend(BackendKind::SingleStage, model)?;
            backends = backends.with(BackendKind::SingleStage, handle);
        }
        Ok(backends)
    }
}

#[cfg(feature = "tflite")]
fn load_backend(kind: BackendKind, model: &ModelConfig) -> Result<BackendHandle, BackendError> {
    tracing::info!(%kind, model = %model.model_filename, "loading backend");
    let handle: BackendHandle = match kind {
        BackendKind::RegionProposal => Arc::new(RegionProposalStage::new(model)?),
        BackendKind::SingleStage => Arc::new(SingleStageStage::new(model)?),
    };
    Ok(handle)
}

#[cfg(not(feature = "tflite"))]
fn load_backend(kind: BackendKind, model: &ModelConfig) -> Result<BackendHandle, BackendError> {
    tracing::error!(%kind, model = %model.model_filename, "no inference runtime compiled in");
    Err(BackendError::Unsupported(kind))
}
