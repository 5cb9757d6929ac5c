//! Stream integrity for upstream completion streams
//!
//! The provider streams newline-delimited `data: <json>` frames terminated by
//! `data: [DONE]`. Providers also interleave keep-alive comments, processing
//! notices, and occasionally an error object in place of a completion chunk,
//! any of which can crash a client that indexes `choices[0].delta`.
//!
//! `StreamSanitizer` is a state machine fed raw byte chunks. It reassembles
//! lines across chunk boundaries, classifies each line into a `StreamFrame`,
//! and emits only frames the client can consume:
//!
//! - content deltas are forwarded verbatim;
//! - the first `[DONE]` sentinel is forwarded; any frame after it is dropped,
//!   so the output always ends on the sentinel;
//! - a provider error is replaced by one synthetic content delta carrying a
//!   readable summary, followed by `[DONE]`, and the stream ends there;
//! - blank lines, non-`data:` lines, chunks without `choices` and unparseable
//!   payloads are dropped.
//!
//! `SanitizedStream` drives the state machine from any byte stream.

use bytes::Bytes;
use futures::stream::Stream;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

use crate::knowledge::types::display_value;

/// Terminal sentinel payload
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// Longest partial line kept while waiting for its newline
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Why a line was not forwarded
#[derive(Debug, Clone, PartialEq)]
pub enum UnrecognizedReason {
    /// Empty or whitespace-only line
    Blank,
    /// Line without the `data:` prefix (comments, processing notices)
    NonData,
    /// Payload is not valid JSON
    Malformed(String),
    /// Valid JSON without a non-empty `choices` array
    NoContent,
}

/// Error reported by the provider inside an otherwise successful stream
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderError {
    pub code: Option<String>,
    pub message: String,
    pub provider: Option<String>,
}

impl ProviderError {
    fn from_value(error: &Value) -> Self {
        match error {
            Value::Object(fields) => Self {
                code: fields
                    .get("code")
                    .filter(|c| !c.is_null())
                    .map(display_value),
                message: fields
                    .get("message")
                    .map(display_value)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "unknown error".to_string()),
                provider: error
                    .pointer("/metadata/provider_name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            other => Self {
                code: None,
                message: display_value(other),
                provider: None,
            },
        }
    }

    /// Human-readable summary delivered to the client in place of the error
    pub fn summary(&self) -> String {
        let origin = match (&self.code, &self.provider) {
            (Some(code), Some(provider)) => format!(" ({code} - {provider})"),
            (Some(code), None) => format!(" ({code})"),
            (None, Some(provider)) => format!(" ({provider})"),
            (None, None) => String::new(),
        };
        format!(
            "[Error] The completion provider reported an error{origin}: {}. \
             The assistant can't answer right now, please try again later.",
            self.message.trim_end_matches('.')
        )
    }

    /// Synthetic content-delta frame carrying `summary()`
    pub fn substitute_frame(&self) -> Bytes {
        let chunk = json!({
            "choices": [{
                "index": 0,
                "delta": { "content": self.summary() },
                "finish_reason": "stop"
            }]
        });
        data_frame(&chunk.to_string())
    }
}

/// One classified line of the upstream stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// A completion chunk with a usable `choices` array
    ContentDelta,
    /// A provider error object
    ProviderError(ProviderError),
    /// The `[DONE]` terminal marker
    Sentinel,
    /// Anything that must not reach the client
    Unrecognized(UnrecognizedReason),
}

/// Classify a single complete line (without its trailing newline)
pub fn classify_line(line: &str) -> StreamFrame {
    if line.trim().is_empty() {
        return StreamFrame::Unrecognized(UnrecognizedReason::Blank);
    }

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return StreamFrame::Unrecognized(UnrecognizedReason::NonData);
    };
    let payload = payload.trim();

    if payload == DONE_SENTINEL {
        return StreamFrame::Sentinel;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => return StreamFrame::Unrecognized(UnrecognizedReason::Malformed(e.to_string())),
    };

    if let Some(error) = value.get("error").filter(|e| is_truthy(e)) {
        return StreamFrame::ProviderError(ProviderError::from_value(error));
    }

    match value.get("choices").and_then(Value::as_array) {
        Some(choices) if !choices.is_empty() => StreamFrame::ContentDelta,
        _ => StreamFrame::Unrecognized(UnrecognizedReason::NoContent),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn data_frame(payload: &str) -> Bytes {
    Bytes::from(format!("{DATA_PREFIX} {payload}\n"))
}

/// The terminal `data: [DONE]` frame
pub fn done_frame() -> Bytes {
    data_frame(DONE_SENTINEL)
}

/// Sanitizer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizerState {
    /// Waiting for (the rest of) a line
    Buffering,
    /// Processing complete lines of the current chunk
    Emitting,
    /// No further input is processed
    Terminated,
}

/// Counters for a sanitized stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizerStats {
    pub forwarded: usize,
    pub dropped: usize,
    pub malformed: usize,
}

/// Line-reassembling, frame-filtering state machine
#[derive(Debug)]
pub struct StreamSanitizer {
    buffer: Vec<u8>,
    state: SanitizerState,
    content_forwarded: bool,
    sentinel_forwarded: bool,
    /// Set after an oversized partial line was discarded; input is skipped
    /// up to the next newline
    skipping_line: bool,
    stats: SanitizerStats,
}

impl Default for StreamSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: SanitizerState::Buffering,
            content_forwarded: false,
            sentinel_forwarded: false,
            skipping_line: false,
            stats: SanitizerStats::default(),
        }
    }

    pub fn state(&self) -> SanitizerState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SanitizerState::Terminated
    }

    pub fn stats(&self) -> SanitizerStats {
        self.stats
    }

    /// Feed one chunk; returns the frames to forward, in input order.
    ///
    /// Complete lines are processed immediately. The trailing partial line is
    /// kept for the next chunk. Splitting happens on raw bytes, so multi-byte
    /// characters cut by a chunk boundary are reassembled before decoding.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.is_terminated() {
            return out;
        }

        let mut chunk = chunk;
        if self.skipping_line {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.skipping_line = false;
                    chunk = &chunk[pos + 1..];
                }
                None => return out,
            }
        }

        // Only the new chunk can hold the last newline
        let previous_len = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        let Some(last_newline) = chunk
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|pos| previous_len + pos)
        else {
            if self.buffer.len() > MAX_LINE_BYTES {
                warn!(
                    buffered = self.buffer.len(),
                    limit = MAX_LINE_BYTES,
                    "Stream line exceeds limit, discarding truncated frame"
                );
                self.buffer.clear();
                self.skipping_line = true;
                self.stats.dropped += 1;
            }
            return out;
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        self.state = SanitizerState::Emitting;
        for raw in complete[..complete.len() - 1].split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.process_line(line, &mut out);
            if self.is_terminated() {
                self.buffer.clear();
                return out;
            }
        }
        self.state = SanitizerState::Buffering;

        out
    }

    /// Signal end of input; returns any closing frames.
    ///
    /// A leftover partial line is discarded. If content was forwarded but no
    /// sentinel was, a `[DONE]` frame is appended.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.is_terminated() {
            return out;
        }

        if !self.buffer.is_empty() {
            warn!(
                leftover = %String::from_utf8_lossy(&self.buffer),
                "Upstream stream ended mid-line, discarding truncated frame"
            );
            self.buffer.clear();
            self.stats.dropped += 1;
        }

        if self.content_forwarded && !self.sentinel_forwarded {
            debug!("Upstream stream ended without [DONE], appending sentinel");
            out.push(done_frame());
            self.sentinel_forwarded = true;
        }

        self.state = SanitizerState::Terminated;
        out
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        match classify_line(line) {
            StreamFrame::ContentDelta if self.sentinel_forwarded => {
                warn!(%line, "Dropping content frame received after [DONE]");
                self.stats.dropped += 1;
            }
            StreamFrame::ContentDelta => {
                out.push(Bytes::from(format!("{line}\n")));
                self.content_forwarded = true;
                self.stats.forwarded += 1;
            }
            StreamFrame::Sentinel => {
                if self.sentinel_forwarded {
                    debug!("Dropping repeated [DONE] sentinel");
                    self.stats.dropped += 1;
                } else {
                    out.push(Bytes::from(format!("{line}\n")));
                    self.sentinel_forwarded = true;
                    self.stats.forwarded += 1;
                }
            }
            StreamFrame::ProviderError(provider_error) if self.sentinel_forwarded => {
                warn!(
                    message = %provider_error.message,
                    "Provider reported an error after [DONE], closing"
                );
                self.stats.dropped += 1;
                self.state = SanitizerState::Terminated;
            }
            StreamFrame::ProviderError(provider_error) => {
                error!(
                    code = provider_error.code.as_deref().unwrap_or("none"),
                    provider = provider_error.provider.as_deref().unwrap_or("unknown"),
                    message = %provider_error.message,
                    "Provider reported an error mid-stream, substituting and closing"
                );
                out.push(provider_error.substitute_frame());
                out.push(done_frame());
                self.sentinel_forwarded = true;
                self.stats.forwarded += 2;
                self.state = SanitizerState::Terminated;
            }
            StreamFrame::Unrecognized(reason) => {
                self.stats.dropped += 1;
                match reason {
                    UnrecognizedReason::Blank | UnrecognizedReason::NoContent => {}
                    UnrecognizedReason::NonData => {
                        warn!(%line, "Dropping non-standard stream line");
                    }
                    UnrecognizedReason::Malformed(parse_error) => {
                        self.stats.malformed += 1;
                        error!(%line, error = %parse_error, "Dropping unparseable stream frame");
                    }
                }
            }
        }
    }
}

/// Byte stream adapter that runs a `StreamSanitizer` over `inner`.
///
/// An error from `inner` is logged and treated as end of input. After a
/// provider error has been substituted, `inner` is not polled again.
pub struct SanitizedStream<S> {
    inner: S,
    sanitizer: StreamSanitizer,
    pending: VecDeque<Bytes>,
    finished: bool,
}

impl<S> SanitizedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            sanitizer: StreamSanitizer::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, E> Stream for SanitizedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.finished || this.sanitizer.is_terminated() {
                if !this.finished {
                    this.finished = true;
                    let stats = this.sanitizer.stats();
                    debug!(
                        forwarded = stats.forwarded,
                        dropped = stats.dropped,
                        malformed = stats.malformed,
                        "Sanitized stream closed"
                    );
                }
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending.extend(this.sanitizer.push(&chunk));
                }
                Poll::Ready(Some(Err(e))) => {
                    warn!("Upstream stream failed mid-response: {e}");
                    this.pending.extend(this.sanitizer.finish());
                }
                Poll::Ready(None) => {
                    this.pending.extend(this.sanitizer.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
