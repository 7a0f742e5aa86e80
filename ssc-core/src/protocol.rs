//! Callback protocol: every UI-originated operation answers its sequence exactly once
//! with a JSON envelope carrying either `data` or `err`.

use std::io;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::post::Post;

/// Sequence used for results the UI did not ask for (e.g. datagrams from a reading peer).
pub const UNSOLICITED_SEQ: &str = "-1";

pub const ERR_NOT_FOUND: &str = "NOT_FOUND_ERR";
pub const ERR_NOT_RUNNING: &str = "ERR_SOCKET_DGRAM_NOT_RUNNING";
pub const ERR_ALREADY_BOUND: &str = "ERR_SOCKET_ALREADY_BOUND";
pub const ERR_NOT_BOUND: &str = "ERR_SOCKET_NOT_BOUND";
pub const ERR_IS_CONNECTED: &str = "ERR_SOCKET_DGRAM_IS_CONNECTED";
pub const ERR_NOT_CONNECTED: &str = "ERR_SOCKET_DGRAM_NOT_CONNECTED";
pub const ERR_ALREADY_READING: &str = "ERR_SOCKET_ALREADY_READING";
pub const ERR_INVALID_ARG: &str = "ERR_INVALID_ARG_VALUE";
pub const ERR_DNS_SUBMIT: &str = "ERR_DNS_SUBMIT";
pub const ERR_LOOP_SHUTDOWN: &str = "ERR_LOOP_SHUTDOWN";
pub const ERR_FORMAT: &str = "ERR_FORMAT";
pub const ERR_STALE_DESCRIPTOR: &str = "ERR_STALE_DESCRIPTOR";

/// Typed error surface. Converted to the envelope's `err` object at the operation boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Operation targets an unknown peer, post or descriptor id.
    #[error("{0}")]
    NotFound(String),
    /// Operation on a peer that is closing or closed.
    #[error("The socket has already been closed")]
    AlreadyClosed,
    /// OS-level failure (socket, resolver) or a rejected request.
    #[error("{message}")]
    Internal {
        code: Option<String>,
        message: String,
    },
    /// Resolution succeeded but the result could not be formatted.
    #[error("{0}")]
    Format(String),
    /// Descriptor invalidated by a page reload.
    #[error("descriptor {0} was invalidated by a page reload")]
    StaleDescriptor(u64),
}

impl CoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        CoreError::NotFound(message.into())
    }

    pub fn internal(code: &str, message: impl Into<String>) -> Self {
        CoreError::Internal {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// Wrap an OS error. The message is the OS error string; the code is the raw errno when known.
    pub fn os(err: &io::Error) -> Self {
        CoreError::Internal {
            code: err.raw_os_error().map(|c| c.to_string()),
            message: err.to_string(),
        }
    }

    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Self::internal(ERR_INVALID_ARG, message)
    }

    pub fn shutdown() -> Self {
        Self::internal(ERR_LOOP_SHUTDOWN, "The event loop shut down before the request completed")
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            CoreError::NotFound(_) => Some(ERR_NOT_FOUND),
            CoreError::AlreadyClosed => Some(ERR_NOT_RUNNING),
            CoreError::Internal { code, .. } => code.as_deref(),
            CoreError::Format(_) => Some(ERR_FORMAT),
            CoreError::StaleDescriptor(_) => Some(ERR_STALE_DESCRIPTOR),
        }
    }

    /// Value of the envelope's `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NotFoundError",
            CoreError::AlreadyClosed | CoreError::Internal { .. } => "InternalError",
            CoreError::Format(_) => "FormatError",
            CoreError::StaleDescriptor(_) => "InvalidStateError",
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        CoreError::os(&err)
    }
}

/// `err` object of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// `{ source, data }` or `{ source, err }`; never both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorBody>,
}

impl Envelope {
    pub fn data(source: impl Into<String>, data: Value) -> Self {
        Self {
            source: source.into(),
            data: Some(data),
            err: None,
        }
    }

    pub fn error(source: impl Into<String>, id: Option<u64>, error: &CoreError) -> Self {
        Self {
            source: source.into(),
            data: None,
            err: Some(ErrorBody {
                id: id.map(|id| id.to_string()),
                code: error.code().map(str::to_string),
                kind: error.type_name().to_string(),
                message: error.to_string(),
            }),
        }
    }

    pub fn from_result(source: impl Into<String>, id: Option<u64>, result: Result<Value, CoreError>) -> Self {
        match result {
            Ok(data) => Self::data(source, data),
            Err(e) => Self::error(source, id, &e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    pub fn to_json(&self) -> String {
        // Envelope holds only strings and JSON values; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// What the core hands back to the UI bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Resolve `seq` with this envelope.
    Envelope { seq: String, envelope: Envelope },
    /// Evaluate this script in the webview; it fetches a cached post and emits `data`.
    Script { seq: String, script: String },
    /// Body of a cached post requested through `ipc://post?id=<id>`.
    Post { seq: String, post: Post },
}

impl Response {
    pub fn seq(&self) -> &str {
        match self {
            Response::Envelope { seq, .. } | Response::Script { seq, .. } | Response::Post { seq, .. } => seq,
        }
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Response::Envelope { envelope, .. } => Some(envelope),
            _ => None,
        }
    }
}

/// Completion callback supplied by the IPC-dispatch layer.
pub type Callback = Arc<dyn Fn(Response) + Send + Sync>;

/// Single-shot completion handle for one in-flight request.
///
/// Consumed by [`PendingRequest::resolve`] or [`PendingRequest::end`]. If it is dropped
/// unanswered (work discarded at shutdown, task aborted) it answers the sequence with
/// `ERR_LOOP_SHUTDOWN`, so every request completes exactly once.
pub struct PendingRequest {
    seq: String,
    source: String,
    callback: Option<Callback>,
}

impl PendingRequest {
    pub fn new(seq: impl Into<String>, source: impl Into<String>, callback: Callback) -> Self {
        Self {
            seq: seq.into(),
            source: source.into(),
            callback: Some(callback),
        }
    }

    pub fn seq(&self) -> &str {
        &self.seq
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Answer with `data` or `err`; `id` is echoed in error bodies.
    pub fn resolve(mut self, id: Option<u64>, result: Result<Value, CoreError>) {
        let envelope = Envelope::from_result(self.source.clone(), id, result);
        let seq = std::mem::take(&mut self.seq);
        self.finish(Response::Envelope { seq, envelope });
    }

    /// Answer with a prepared response.
    pub fn end(mut self, response: Response) {
        self.finish(response);
    }

    fn finish(&mut self, response: Response) {
        if let Some(callback) = self.callback.take() {
            callback(response);
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.callback.is_some() {
            warn!(seq = %self.seq, source = %self.source, "request dropped before completion");
            let envelope = Envelope::error(self.source.clone(), None, &CoreError::shutdown());
            let seq = std::mem::take(&mut self.seq);
            self.finish(Response::Envelope { seq, envelope });
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("seq", &self.seq)
            .field("source", &self.source)
            .field("answered", &self.callback.is_none())
            .finish()
    }
}
