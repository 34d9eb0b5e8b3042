//! Progress and response events for in-flight requests.
//!
//! Every pipeline reports through an [`EventSink`]. The CLI prints events on
//! **stderr** so stdout stays parseable; the HTTP server fans them out to
//! server-sent-event subscribers through [`BroadcastSink`].
//!
//! [`RequestEvents`] wraps a sink for one request and enforces the
//! reporting contract: progress never decreases, nothing is reported after
//! the response, and the response is emitted exactly once.

use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ErrorCode;

/// Which pipeline an event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Channel {
    QueryDocument,
    InferenceCompletion,
    AddDocument,
}

impl Channel {
    pub fn progress_event(&self) -> &'static str {
        match self {
            Channel::QueryDocument => "query-document-progress",
            Channel::InferenceCompletion => "inference-completion-progress",
            Channel::AddDocument => "add-document-progress",
        }
    }

    pub fn response_event(&self) -> &'static str {
        match self {
            Channel::QueryDocument => "query-document-response",
            Channel::InferenceCompletion => "inference-completion-response",
            Channel::AddDocument => "add-document-response",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Channel::QueryDocument => "query",
            Channel::InferenceCompletion => "complete",
            Channel::AddDocument => "add",
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub request_id: String,
    pub status: String,
    pub message: String,
    pub progress: u8,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub request_id: String,
    pub success: bool,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Milliseconds.
    pub processing_time: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    Progress {
        channel: Channel,
        event: ProgressEvent,
    },
    Response {
        channel: Channel,
        event: ResponseEvent,
    },
}

impl PipelineEvent {
    /// Transport event name, e.g. `query-document-progress`.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Progress { channel, .. } => channel.progress_event(),
            PipelineEvent::Response { channel, .. } => channel.response_event(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            PipelineEvent::Progress { event, .. } => &event.request_id,
            PipelineEvent::Response { event, .. } => &event.request_id,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            PipelineEvent::Progress { event, .. } => serde_json::to_value(event),
            PipelineEvent::Response { event, .. } => serde_json::to_value(event),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Receives pipeline events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Human-friendly progress on stderr: "query r-1  40%  embedding  Generating prompt embeddings...".
pub struct StderrProgress;

impl EventSink for StderrProgress {
    fn emit(&self, event: PipelineEvent) {
        let line = match &event {
            PipelineEvent::Progress { channel, event } => format!(
                "{} {}  {:>3}%  {}  {}\n",
                channel.label(),
                display_id(&event.request_id),
                event.progress,
                event.status,
                event.message
            ),
            PipelineEvent::Response { channel, event } => match (&event.error, event.success) {
                (_, true) => format!(
                    "{} {}  done in {} ms\n",
                    channel.label(),
                    display_id(&event.request_id),
                    event.processing_time
                ),
                (error, false) => format!(
                    "{} {}  failed: {}\n",
                    channel.label(),
                    display_id(&event.request_id),
                    error.as_deref().unwrap_or("unknown error")
                ),
            },
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

fn display_id(request_id: &str) -> &str {
    if request_id.is_empty() {
        "-"
    } else {
        request_id
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl EventSink for JsonProgress {
    fn emit(&self, event: PipelineEvent) {
        let obj = serde_json::json!({
            "event": event.name(),
            "data": event.payload(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl EventSink for NoProgress {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Fans events out to any number of subscribers. Events sent while nobody
/// is subscribed are dropped.
pub struct BroadcastSink {
    sender: broadcast::Sender<PipelineEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

// ============ Per-request reporting ============

/// Event reporter bound to one request.
pub struct RequestEvents {
    sink: Arc<dyn EventSink>,
    channel: Channel,
    request_id: String,
    last_progress: AtomicU8,
    responded: AtomicBool,
}

impl RequestEvents {
    pub fn new(sink: Arc<dyn EventSink>, channel: Channel, request_id: impl Into<String>) -> Self {
        Self {
            sink,
            channel,
            request_id: request_id.into(),
            last_progress: AtomicU8::new(0),
            responded: AtomicBool::new(false),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Reports progress. A value lower than one already reported is raised
    /// to it; values above 100 are clamped. Ignored after the response.
    pub fn progress(&self, status: &str, message: &str, percent: u8) {
        if self.has_responded() {
            return;
        }
        let percent = percent.min(100);
        let progress = self
            .last_progress
            .fetch_max(percent, Ordering::SeqCst)
            .max(percent);

        tracing::debug!(
            request_id = %self.request_id,
            status,
            progress,
            "{}",
            message
        );
        self.sink.emit(PipelineEvent::Progress {
            channel: self.channel,
            event: ProgressEvent {
                request_id: self.request_id.clone(),
                status: status.to_string(),
                message: message.to_string(),
                progress,
            },
        });
    }

    /// Emits the response. Returns `false` (and emits nothing) when a
    /// response was already sent for this request.
    pub fn respond(&self, event: ResponseEvent) -> bool {
        if self.responded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                request_id = %self.request_id,
                "dropping duplicate response event"
            );
            return false;
        }
        self.sink.emit(PipelineEvent::Response {
            channel: self.channel,
            event,
        });
        true
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }
}
