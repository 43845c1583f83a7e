use std::fmt;
use std::path::Path;

use serde::Deserialize;

use config::{Config, ConfigError, FileFormat};

use crate::pipeline::BackendKind;
use crate::session::CorrelationPolicy;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: Server,
    pub backends: BackendsConfig,
    pub session: SessionConfig,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub region_proposal: Option<ModelConfig>,
    pub single_stage: Option<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub model_filename: String,
    /// Required for the single-stage backend, which reports its own labels.
    #[serde(default)]
    pub label_filename: Option<String>,
    #[serde(default = "ModelConfig::default_input_size")]
    pub input_size: u32,
    /// Zero leaves the runtime default.
    #[serde(default)]
    pub num_threads: u32,
    /// Added to raw class ids before the vocabulary lookup.
    #[serde(default = "ModelConfig::default_class_offset")]
    pub class_offset: i32,
}

impl ModelConfig {
    fn default_input_size() -> u32 {
        512
    }

    fn default_class_offset() -> i32 {
        1
    }

    pub fn new(model_filename: &str) -> Self {
        Self {
            model_filename: model_filename.to_string(),
            label_filename: None,
            input_size: Self::default_input_size(),
            num_threads: 0,
            class_offset: Self::default_class_offset(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Messages a busy session buffers before it stops reading the socket.
    pub max_pending: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_pending: 16 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub iou: Option<f32>,
    #[serde(default = "RouteConfig::default_correlation")]
    pub correlation: CorrelationPolicy,
    #[serde(default = "RouteConfig::default_echo")]
    pub echo_request_id: bool,
}

impl RouteConfig {
    fn default_correlation() -> CorrelationPolicy {
        CorrelationPolicy::Latest
    }

    fn default_echo() -> bool {
        true
    }

    /// Photo-style route: answers only the freshest request and echoes its id.
    pub fn photo(path: &str, backend: BackendKind) -> Self {
        Self {
            path: path.to_string(),
            backend,
            confidence: None,
            iou: None,
            correlation: CorrelationPolicy::Latest,
            echo_request_id: true,
        }
    }

    /// Frame-style route: every frame answered in order, no ids.
    pub fn frames(path: &str, backend: BackendKind) -> Self {
        Self {
            path: path.to_string(),
            backend,
            confidence: None,
            iou: None,
            correlation: CorrelationPolicy::Unconditional,
            echo_request_id: false,
        }
    }
}

impl fmt::Display for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({:?}, echo {})",
            self.path, self.backend, self.correlation, self.echo_request_id
        )
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

pub fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::photo("/ws_photo_fasterrcnn", BackendKind::RegionProposal),
        RouteConfig::photo("/ws_photo_yolo", BackendKind::SingleStage),
        RouteConfig::photo("/ws_capture_and_detect", BackendKind::RegionProposal),
        RouteConfig::frames("/ws_video", BackendKind::SingleStage),
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: Server::default(),
            backends: BackendsConfig {
                region_proposal: Some(ModelConfig::new("model/fasterrcnn.tflite")),
                single_stage: Some(ModelConfig {
                    label_filename: Some("model/yolov8_labels.txt".to_string()),
                    ..ModelConfig::new("model/yolov8.tflite")
                }),
            },
            session: SessionConfig::default(),
            routes: default_routes(),
        }
    }
}

impl AppConfig {
    const ENV_PREFIX: &'static str = "DETSTREAM";

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from_str(text, FileFormat::Yaml))
            .build()?
            .try_deserialize()
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(Self::ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }
}
