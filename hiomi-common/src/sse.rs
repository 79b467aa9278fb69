//! Server-Sent Events (SSE) utilities
//!
//! Server side: keep-alive wrapper shared by the web service streams.
//! Client side: an incremental decoder for `text/event-stream` bodies used by
//! the result push channel.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;

/// Heartbeat interval for server streams
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Wrap an event stream with the standard heartbeat keep-alive
///
/// # Example
/// ```rust,ignore
/// pub async fn event_stream() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
///     hiomi_common::sse::with_heartbeat(futures::stream::pending())
/// }
/// ```
pub fn with_heartbeat<S>(stream: S) -> Sse<S>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name; `message` when the stream did not name it
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id seen on the stream
    pub id: Option<String>,
}

/// Largest event the decoder buffers before discarding it
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Incremental `text/event-stream` decoder
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence or between
/// the `\r` and `\n` of a line ending. Comment lines (heartbeats) and events
/// without data are skipped. An unterminated event at end of stream is never
/// dispatched.
///
/// At most `max_event_bytes` are buffered between blank lines. An event that
/// grows past the limit is dropped along with the rest of its lines and
/// counted in [`SseDecoder::take_discarded`].
#[derive(Debug)]
pub struct SseDecoder {
    line: Vec<u8>,
    skip_lf: bool,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    max_event_bytes: usize,
    /// Bytes buffered since the last blank line
    event_bytes: usize,
    /// Skipping the remainder of an oversized event
    discarding: bool,
    /// The current line had bytes while discarding
    discarded_line: bool,
    discarded: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            line: Vec::new(),
            skip_lf: false,
            event: None,
            data: Vec::new(),
            last_id: None,
            max_event_bytes,
            event_bytes: 0,
            discarding: false,
            discarded_line: false,
            discarded: 0,
        }
    }

    /// Number of oversized events dropped since the last call
    pub fn take_discarded(&mut self) -> usize {
        std::mem::take(&mut self.discarded)
    }

    /// Feed a chunk of the body, returning every event it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }

            match byte {
                b'\r' | b'\n' => {
                    self.skip_lf = byte == b'\r';

                    if self.discarding {
                        // A blank line ends the oversized event
                        if !self.discarded_line {
                            self.discarding = false;
                            self.event_bytes = 0;
                        }
                        self.discarded_line = false;
                        continue;
                    }

                    let line = std::mem::take(&mut self.line);
                    if line.is_empty() {
                        self.event_bytes = 0;
                    }
                    let line = String::from_utf8_lossy(&line);
                    if let Some(frame) = self.process_line(&line) {
                        frames.push(frame);
                    }
                }
                _ if self.discarding => self.discarded_line = true,
                _ => {
                    self.event_bytes += 1;
                    if self.event_bytes > self.max_event_bytes {
                        self.discard_event();
                    } else {
                        self.line.push(byte);
                    }
                }
            }
        }

        frames
    }

    fn discard_event(&mut self) {
        self.line = Vec::new();
        self.data = Vec::new();
        self.event = None;
        self.discarding = true;
        self.discarded_line = true;
        self.discarded += 1;
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            _ => {} // retry and unknown fields
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }

        Some(SseFrame {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.last_id.clone(),
        })
    }
}
