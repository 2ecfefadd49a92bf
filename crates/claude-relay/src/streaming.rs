//! Streaming conversion (SSE).
//!
//! The upstream streams OpenAI-style Server-Sent Events: `data: {json}` lines
//! and a terminal `data: [DONE]` marker. Claude clients expect Anthropic-style
//! events (`message_start`, `content_block_delta`, ...). [`StreamReframer`]
//! turns one into the other incrementally, one instance per exchange, and
//! [`reframe`] wraps it around an upstream byte stream.
//!
//! A tool call is opened with a `content_block_start` event carrying a
//! `tool_use` block (id, name, empty input), followed by `content_block_delta`
//! events of type `input_json_delta`. Only a tool call at index 0 gets that
//! start event. Argument deltas for parallel calls at other indices are
//! forwarded without one.

use crate::openai::{ChatCompletionChunk, ToolCallFragment};
use crate::translation::{STOP_END_TURN, STOP_TOOL_USE};
use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::fmt::Display;
use tracing::{debug, warn};

const DONE_MARKER: &str = "[DONE]";

/// One Anthropic-format event, ready to be framed onto the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub name: &'static str,
    pub data: Value,
}

impl StreamEvent {
    fn new(name: &'static str, data: Value) -> Self {
        Self { name, data }
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name, self.data)
    }
}

/// Per-exchange state for turning upstream chunks into Anthropic events.
#[derive(Debug, Default)]
pub struct StreamReframer {
    /// Bytes after the last newline seen so far.
    pending: Vec<u8>,
    message_id: Option<String>,
    model: Option<String>,
    started: bool,
    text_block_started: bool,
    tool_call_seen: bool,
    closed: bool,
}

impl StreamReframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feed one raw upstream chunk; returns the events it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }

        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.process_line(&line, &mut events);
        }
        events
    }

    /// Flush any trailing line and emit the single terminal event.
    ///
    /// Calling this again, or after [`close`](Self::close), yields nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }

        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.process_line(&line, &mut events);
        }

        self.ensure_message_start(&mut events);
        let stop_reason = if self.tool_call_seen {
            STOP_TOOL_USE
        } else {
            STOP_END_TURN
        };
        events.push(StreamEvent::new(
            "message_stop",
            json!({"type": "message_stop", "stop_reason": stop_reason}),
        ));
        self.closed = true;
        events
    }

    /// Stop without a terminal event. Later pushes and finishes are no-ops.
    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }

    fn process_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data == DONE_MARKER {
            return;
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, frame = %data, "skipping malformed upstream SSE frame");
                return;
            }
        };
        self.process_chunk(chunk, events);
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk, events: &mut Vec<StreamEvent>) {
        if self.message_id.is_none() {
            self.message_id = chunk.id;
        }
        if self.model.is_none() {
            self.model = chunk.model;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };
        let delta = choice.delta;

        if let Some(calls) = delta.tool_calls {
            for call in calls {
                self.process_tool_fragment(call, events);
            }
        }

        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            self.ensure_message_start(events);
            if !self.text_block_started {
                self.text_block_started = true;
                events.push(StreamEvent::new(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": {"type": "text", "text": ""}
                    }),
                ));
            }
            events.push(StreamEvent::new(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": text}
                }),
            ));
        }
    }

    fn process_tool_fragment(&mut self, call: ToolCallFragment, events: &mut Vec<StreamEvent>) {
        self.tool_call_seen = true;
        let (name, arguments) = match call.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };

        if let (0, Some(id)) = (call.index, call.id) {
            self.ensure_message_start(events);
            events.push(StreamEvent::new(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {
                        "type": "tool_use",
                        "id": id,
                        "name": name.unwrap_or_default(),
                        "input": {}
                    }
                }),
            ));
        }

        if let Some(partial) = arguments.filter(|a| !a.is_empty()) {
            events.push(StreamEvent::new(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": call.index,
                    "delta": {"type": "input_json_delta", "partial_json": partial}
                }),
            ));
        }
    }

    fn ensure_message_start(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::new(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id.clone().unwrap_or_default(),
                    "type": "message",
                    "role": "assistant",
                    "model": self.model.clone().unwrap_or_default(),
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ));
    }
}

/// Logs when a stream is dropped before it ran to completion, which is how a
/// caller disconnect shows up.
struct ExchangeGuard {
    completed: bool,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if !self.completed {
            debug!("stream dropped before completion, upstream no longer consumed");
        }
    }
}

/// Reframe an upstream OpenAI SSE byte stream into Anthropic SSE frames.
///
/// The returned stream yields fully formatted frames:
///
/// ```text
/// event: message_start
/// data: {...}
///
/// ```
///
/// A read error ends the output without a terminal event. Dropping the output
/// stops reading the upstream.
pub fn reframe<S, E>(upstream: S) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    stream! {
        let mut guard = ExchangeGuard { completed: false };
        let mut reframer = StreamReframer::new();
        let mut upstream = Box::pin(upstream);

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in reframer.push(&bytes) {
                        yield Bytes::from(event.to_sse());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "upstream stream failed mid-response, closing");
                    reframer.close();
                    break;
                }
            }
        }

        for event in reframer.finish() {
            yield Bytes::from(event.to_sse());
        }
        guard.completed = true;
    }
}
