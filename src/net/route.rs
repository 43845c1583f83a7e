use std::collections::HashSet;
use std::sync::Arc;

use crate::app::config::RouteConfig;
use crate::pipeline::{BackendHandle, BackendKind, Backends, DetectOptions};
use crate::session::CorrelationPolicy;

/// Everything a session needs from its endpoint, fixed at accept time.
#[derive(Clone)]
pub struct Route {
    pub path: String,
    pub backend: BackendHandle,
    pub options: DetectOptions,
    pub policy: CorrelationPolicy,
    pub echo_request_id: bool,
}

impl Route {
    pub fn new(path: &str, backend: BackendHandle, options: DetectOptions) -> Self {
        Self {
            path: path.to_string(),
            backend,
            options,
            policy: CorrelationPolicy::Latest,
            echo_request_id: true,
        }
    }

    pub fn with_policy(mut self, policy: CorrelationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_echo(mut self, echo_request_id: bool) -> Self {
        self.echo_request_id = echo_request_id;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route path {0:?} must start with '/'")]
    BadPath(String),
    #[error("route path {0:?} is configured twice")]
    Duplicate(String),
    #[error("route {path} uses the {backend} backend, which is not configured")]
    MissingBackend { path: String, backend: BackendKind },
    #[error("route {path} has {name} {value} outside [0, 1]")]
    Threshold {
        path: String,
        name: &'static str,
        value: f32,
    },
}

#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Resolve configured routes against the loaded backends.
    pub fn build(configs: &[RouteConfig], backends: &Backends) -> Result<Self, RouteError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(configs.len());
        for config in configs {
            if !config.path.starts_with('/') {
                return Err(RouteError::BadPath(config.path.clone()));
            }
            if !seen.insert(config.path.as_str()) {
                return Err(RouteError::Duplicate(config.path.clone()));
            }
            let backend = backends
                .get(config.backend)
                .ok_or_else(|| RouteError::MissingBackend {
                    path: config.path.clone(),
                    backend: config.backend,
                })?;
            let defaults = config.backend.default_options();
            let options = DetectOptions {
                confidence: config.confidence.unwrap_or(defaults.confidence),
                iou: config.iou.or(defaults.iou),
            };
            check_threshold(&config.path, "confidence", Some(options.confidence))?;
            check_threshold(&config.path, "iou", options.iou)?;

            tracing::debug!(%config, "route resolved");
            routes.push(
                Route::new(&config.path, backend.clone(), options)
                    .with_policy(config.correlation)
                    .with_echo(config.echo_request_id),
            );
        }
        Ok(Self::new(routes))
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|route| route.path == path).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn check_threshold(path: &str, name: &'static str, value: Option<f32>) -> Result<(), RouteError> {
    match value {
        Some(value) if !(0.0..=1.0).contains(&value) => Err(RouteError::Threshold {
            path: path.to_string(),
            name,
            value,
        }),
        _ => Ok(()),
    }
}
