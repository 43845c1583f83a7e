//! One connection's receive → decode → infer → respond cycle.
//!
//! A session is strictly sequential: at most one inference is in flight and
//! responses go out in request order. While busy it keeps reading the socket
//! so the correlator learns about newer requests as soon as they arrive;
//! those are queued and served afterwards, unless they turn stale first.

mod correlator;
pub mod message;

pub use correlator::{CorrelationPolicy, RequestCorrelator};
pub use message::{encode, InboundRequest, OutboundResponse, RequestId};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::app::config::SessionConfig;
use crate::codec::{self, DecodeError};
use crate::net::route::Route;
use crate::pipeline::InferenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    AwaitingMessage,
    Decoding,
    Inferring,
    Responding,
    Closed,
}

/// Where a stale request was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Decoded,
    Responding,
}

/// Why a request produced no response. None of these reach the client.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Schema(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("superseded by a newer request ({0:?})")]
    Stale(Checkpoint),
    #[error("cannot encode response: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("connection closed with the request in flight")]
    Closed,
}

/// Per-session counters, reported when the session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub received: u64,
    pub answered: u64,
    pub stale: u64,
    pub schema_errors: u64,
    pub decode_errors: u64,
    pub inference_errors: u64,
}

pub struct Session {
    route: Arc<Route>,
    correlator: RequestCorrelator,
    pending: VecDeque<InboundRequest>,
    max_pending: usize,
    state: SessionState,
    closed: bool,
    stats: SessionStats,
}

impl Session {
    pub fn new(route: Arc<Route>, config: SessionConfig) -> Self {
        let correlator = RequestCorrelator::new(route.policy);
        Self {
            route,
            correlator,
            pending: VecDeque::new(),
            max_pending: config.max_pending.max(1),
            state: SessionState::Accepted,
            closed: false,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the client leaves or `shutdown` fires.
    pub async fn run<S, E, K>(mut self, mut stream: S, mut sink: K, shutdown: CancellationToken) -> SessionStats
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
        K: Sink<Message> + Unpin,
        K::Error: fmt::Display,
    {
        tracing::info!(backend = self.route.backend.name(), policy = ?self.route.policy, "session accepted");
        self.enter(SessionState::AwaitingMessage);

        while !self.closed {
            let Some(request) = self.pending.pop_front() else {
                select! {
                    // CANCEL SAFETY: `StreamExt::next` is cancel safe.
                    frame = stream.next() => self.receive(frame),
                    _ = shutdown.cancelled() => {
                        tracing::debug!("shutdown requested");
                        break;
                    }
                }
                continue;
            };

            match self.process(request, &mut stream, &shutdown).await {
                Ok(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        tracing::warn!(%err, "send failed, closing session");
                        break;
                    }
                    self.stats.answered += 1;
                }
                Err(err) => self.reject(err),
            }
            if !self.closed {
                self.enter(SessionState::AwaitingMessage);
            }
        }

        self.enter(SessionState::Closed);
        let _ = sink.close().await;
        tracing::info!(stats = ?self.stats, "session closed");
        self.stats
    }

    async fn process<S, E>(
        &mut self,
        request: InboundRequest,
        stream: &mut S,
        shutdown: &CancellationToken,
    ) -> Result<String, RequestError>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let InboundRequest { request_id, image } = request;

        self.enter(SessionState::Decoding);
        let bitmap = codec::decode(&image)?;
        self.drain_ready(stream);
        if self.closed {
            return Err(RequestError::Closed);
        }
        if !self.correlator.is_current(request_id.as_ref()) {
            return Err(RequestError::Stale(Checkpoint::Decoded));
        }

        self.enter(SessionState::Inferring);
        let backend = self.route.backend.clone();
        let options = self.route.options;
        let started = Instant::now();
        let mut inference = tokio::task::spawn_blocking(move || backend.detect(&bitmap, &options));
        let joined = loop {
            select! {
                joined = &mut inference => break joined,
                // CANCEL SAFETY: `StreamExt::next` is cancel safe.
                frame = stream.next(), if self.pending.len() < self.max_pending => {
                    self.receive(frame);
                    if self.closed {
                        return Err(RequestError::Closed);
                    }
                }
                _ = shutdown.cancelled() => {
                    self.closed = true;
                    return Err(RequestError::Closed);
                }
            }
        };
        let results = joined.map_err(|err| {
            InferenceError::new(self.route.backend.name(), format!("inference task failed: {err}"))
        })??;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            boxes = results.len(),
            "inference finished"
        );

        self.enter(SessionState::Responding);
        self.drain_ready(stream);
        if self.closed {
            return Err(RequestError::Closed);
        }
        if !self.correlator.is_current(request_id.as_ref()) {
            return Err(RequestError::Stale(Checkpoint::Responding));
        }
        let echoed = if self.route.echo_request_id {
            request_id.as_ref()
        } else {
            None
        };
        encode(&results, echoed).map_err(RequestError::Encode)
    }

    /// Take one transport frame. Requests are parsed and observed by the
    /// correlator immediately, then queued.
    fn receive<E: fmt::Display>(&mut self, frame: Option<Result<Message, E>>) {
        match frame {
            Some(Ok(Message::Text(text))) => match InboundRequest::parse(&text) {
                Ok(request) => {
                    self.stats.received += 1;
                    self.correlator.observe(request.request_id.as_ref());
                    self.pending.push_back(request);
                }
                Err(err) => self.reject(RequestError::Schema(err.to_string())),
            },
            Some(Ok(Message::Binary(bytes))) => {
                self.reject(RequestError::Schema(format!("binary frame of {} bytes", bytes.len())))
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "client closed");
                self.closed = true;
            }
            Some(Err(err)) => {
                tracing::warn!(%err, "transport error");
                self.closed = true;
            }
            None => {
                tracing::debug!("stream ended");
                self.closed = true;
            }
        }
    }

    /// Pull in frames that are already waiting, without suspending.
    fn drain_ready<S, E>(&mut self, stream: &mut S)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        while !self.closed && self.pending.len() < self.max_pending {
            match stream.next().now_or_never() {
                Some(frame) => self.receive(frame),
                None => break,
            }
        }
    }

    fn reject(&mut self, err: RequestError) {
        match &err {
            RequestError::Schema(_) => {
                self.stats.schema_errors += 1;
                tracing::warn!(%err, "dropping request");
            }
            RequestError::Decode(_) => {
                self.stats.decode_errors += 1;
                tracing::warn!(%err, "dropping request");
            }
            RequestError::Inference(inner) => {
                self.stats.inference_errors += 1;
                tracing::error!(backend = %inner.backend, %err, "dropping request");
            }
            RequestError::Stale(checkpoint) => {
                self.stats.stale += 1;
                tracing::debug!(?checkpoint, "stale request dropped");
            }
            RequestError::Encode(_) => tracing::error!(%err, "dropping request"),
            RequestError::Closed => tracing::debug!(%err),
        }
    }

    fn enter(&mut self, state: SessionState) {
        tracing::trace!(from = ?self.state, to = ?state, "session state");
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::stream;
    use serde_json::{json, Value};

    use crate::codec::{encode_png_payload, Bitmap};
    use crate::pipeline::{DetectOptions, DetectionBox, Detections, Detector};

    struct Fixed;

    impl Detector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn detect(&self, bitmap: &Bitmap, options: &DetectOptions) -> Result<Detections, InferenceError> {
            Ok(vec![DetectionBox {
                x1: 0.0,
                y1: 0.0,
                x2: bitmap.width() as f32,
                y2: bitmap.height() as f32,
                label: "frame".to_string(),
                score: options.confidence,
            }])
        }
    }

    fn route(policy: CorrelationPolicy, echo: bool) -> Arc<Route> {
        let options = DetectOptions { confidence: 0.5, iou: None };
        Arc::new(
            Route::new("/test", Arc::new(Fixed), options)
                .with_policy(policy)
                .with_echo(echo),
        )
    }

    fn image() -> String {
        encode_png_payload(&Bitmap::new(3, 2)).unwrap()
    }

    fn text(value: Value) -> Result<Message, Infallible> {
        Ok(Message::Text(value.to_string()))
    }

    /// Feed `frames` to a session over a stream that stays open, collect
    /// `expected` responses, then shut the session down.
    async fn exchange(
        route: Arc<Route>,
        frames: Vec<Result<Message, Infallible>>,
        expected: usize,
    ) -> (SessionStats, Vec<Value>) {
        let input = stream::iter(frames).chain(stream::pending());
        let (out_tx, mut out_rx) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(
            Session::new(route, SessionConfig::default()).run(input, out_tx, shutdown.clone()),
        );

        let mut sent = Vec::new();
        for _ in 0..expected {
            let message = tokio::time::timeout(Duration::from_secs(5), out_rx.next())
                .await
                .expect("response in time")
                .expect("session still open");
            match message {
                Message::Text(text) => sent.push(serde_json::from_str(&text).unwrap()),
                other => panic!("unexpected {other:?}"),
            }
        }
        shutdown.cancel();
        let stats = session.await.unwrap();
        assert!(out_rx.next().await.is_none(), "nothing else may be sent");
        (stats, sent)
    }

    #[tokio::test]
    async fn test_answers_with_echo() {
        let (stats, sent) = exchange(
            route(CorrelationPolicy::Latest, true),
            vec![text(json!({"reqId": "abc", "image": image()}))],
            1,
        )
        .await;
        assert_eq!(stats.answered, 1);
        assert_eq!(sent[0]["reqId"], "abc");
        assert_eq!(sent[0]["results"][0]["x2"], 3.0);
        assert_eq!(sent[0]["results"][0]["score"], 0.5);
    }

    #[tokio::test]
    async fn test_echo_disabled_route_never_echoes() {
        let (_, sent) = exchange(
            route(CorrelationPolicy::Latest, false),
            vec![text(json!({"reqId": "abc", "image": image()}))],
            1,
        )
        .await;
        assert!(sent[0].get("reqId").is_none());
    }

    #[tokio::test]
    async fn test_failures_are_silent_and_typed() {
        let frames = vec![
            text(json!({"reqId": "a", "image": "not-base64!!"})),
            Ok(Message::Text("{oops".to_string())),
            Ok(Message::Binary(vec![1, 2, 3])),
            text(json!({"reqId": "b"})),
            Ok(Message::Ping(vec![])),
            text(json!({"image": image()})),
        ];
        let (stats, sent) = exchange(route(CorrelationPolicy::Latest, true), frames, 1).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].get("reqId").is_none());
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.schema_errors, 3);
        assert_eq!(stats.answered, 1);
    }

    #[tokio::test]
    async fn test_close_frame_discards_queue() {
        let frames: Vec<Result<Message, Infallible>> = vec![
            Ok(Message::Close(None)),
            text(json!({"reqId": "late", "image": image()})),
        ];
        let (out_tx, out_rx) = mpsc::unbounded();
        let session = Session::new(route(CorrelationPolicy::Latest, true), SessionConfig::default());
        assert_eq!(session.state(), SessionState::Accepted);
        let stats = session
            .run(stream::iter(frames), out_tx, CancellationToken::new())
            .await;
        let sent: Vec<Message> = out_rx.collect().await;
        assert!(sent.is_empty());
        assert_eq!(stats.received, 0);
    }

    #[tokio::test]
    async fn test_stream_end_closes_session() {
        let (out_tx, _out_rx) = mpsc::unbounded();
        let stats = Session::new(route(CorrelationPolicy::Latest, true), SessionConfig::default())
            .run(stream::empty::<Result<Message, Infallible>>(), out_tx, CancellationToken::new())
            .await;
        assert_eq!(stats, SessionStats::default());
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_session() {
        let (out_tx, _out_rx) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let stats = Session::new(route(CorrelationPolicy::Latest, true), SessionConfig::default())
            .run(stream::pending::<Result<Message, Infallible>>(), out_tx, shutdown)
            .await;
        assert_eq!(stats, SessionStats::default());
    }
}
