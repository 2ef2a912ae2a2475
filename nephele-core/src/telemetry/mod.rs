//! Pipeline trace events
//!
//! The orchestrator reports every state transition to a [`TraceSink`].
//! Sinks are fire-and-forget: `record` cannot fail and must not block, so
//! a slow or missing consumer never changes how a query is answered.
//!
//! # Example
//!
//! ```rust,ignore
//! use nephele_core::telemetry::trace_channel;
//!
//! let (sink, mut events) = trace_channel(256);
//! let orchestrator = Orchestrator::builder(classifier, synthesizer)
//!     .trace_sink(Arc::new(sink))
//!     .build();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{} -> {}", event.session_id, event.state);
//!     }
//! });
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::workflow::{PipelineState, RouteKind};

/// One state transition of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub session_id: String,
    /// State entered
    pub state: PipelineState,
    /// Route, once decided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteKind>,
    /// Decision or failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    pub fn new(session_id: impl Into<String>, state: PipelineState) -> Self {
        Self {
            session_id: session_id.into(),
            state,
            route: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_route(mut self, route: Option<RouteKind>) -> Self {
        self.route = route;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives trace events
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn record(&self, _event: TraceEvent) {}
}

/// Emits each event as a `tracing` debug event
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTraceSink;

impl TraceSink for LoggingTraceSink {
    fn record(&self, event: TraceEvent) {
        tracing::debug!(
            target: "nephele::trace",
            session_id = %event.session_id,
            state = %event.state,
            route = event.route.map(|r| r.as_str()),
            detail = event.detail.as_deref(),
            "pipeline transition"
        );
    }
}

/// Forwards events into a bounded channel, dropping them when it is full or closed
#[derive(Debug, Clone)]
pub struct ChannelTraceSink {
    sender: mpsc::Sender<TraceEvent>,
}

impl ChannelTraceSink {
    pub fn new(sender: mpsc::Sender<TraceEvent>) -> Self {
        Self { sender }
    }
}

impl TraceSink for ChannelTraceSink {
    fn record(&self, event: TraceEvent) {
        if let Err(e) = self.sender.try_send(event) {
            tracing::trace!(error = %e, "trace event dropped");
        }
    }
}

/// Create a channel sink and its receiving end
pub fn trace_channel(buffer: usize) -> (ChannelTraceSink, mpsc::Receiver<TraceEvent>) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    (ChannelTraceSink::new(sender), receiver)
}
