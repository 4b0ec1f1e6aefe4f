//! Incremental Server-Sent Events codec
//!
//! Three layers, each a small state machine that is safe to feed arbitrary
//! chunk boundaries:
//! - [`LineDecoder`] turns bytes into complete lines, keeping each line's raw
//!   bytes (terminator included) so a proxy can forward untouched lines verbatim.
//! - [`parse_field`] classifies one line (`event:`, `data:`, comment, blank...).
//! - [`EventBuilder`] folds fields into [`SseEvent`]s, dispatching on blank lines.
//!
//! Only `\n` and `\r\n` terminators are recognised; a lone `\r` is kept as
//! line content. A line still unterminated after [`SSE_MAX_LINE_BYTES`] fails
//! the decoder with [`LineTooLong`].

use crate::constants::SSE_MAX_LINE_BYTES;
use bytes::{Bytes, BytesMut};
use std::borrow::Cow;
use thiserror::Error;

/// An unterminated line outgrew the decoder's limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("SSE line exceeds {limit} bytes without a terminator")]
pub struct LineTooLong {
    pub limit: usize,
}

/// One complete line from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    raw: Bytes,
    content_len: usize,
}

impl RawLine {
    /// Full bytes as received, terminator included
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Line content without the terminator
    pub fn content(&self) -> &[u8] {
        &self.raw[..self.content_len]
    }

    /// Terminator bytes (`\n`, `\r\n`, or empty for a flushed partial line)
    pub fn terminator(&self) -> &[u8] {
        &self.raw[self.content_len..]
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.content())
    }
}

/// Splits a byte stream into lines
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    // bytes of `buf` already known to hold no terminator
    scanned: usize,
    max_line: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(SSE_MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Feed a chunk; returns every line completed by it
    ///
    /// Each byte is scanned once however the stream is chunked. Fails once
    /// the unterminated remainder exceeds the line limit; the buffer is
    /// discarded and the stream should be abandoned.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<RawLine>, LineTooLong> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            let raw = self.buf.split_to(pos + 1).freeze();
            self.scanned = 0;
            let content_len = if pos > 0 && raw[pos - 1] == b'\r' {
                pos - 1
            } else {
                pos
            };
            lines.push(RawLine { raw, content_len });
        }
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line {
            self.buf.clear();
            self.scanned = 0;
            return Err(LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(lines)
    }

    /// Flush a trailing line that never got its terminator
    pub fn finish(&mut self) -> Option<RawLine> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let raw = self.buf.split().freeze();
        let content_len = raw.len();
        Some(RawLine { raw, content_len })
    }

    /// Bytes buffered while waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// A classified SSE line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseField<'a> {
    Event(&'a str),
    Data(&'a str),
    Id(&'a str),
    Retry(&'a str),
    Comment(&'a str),
    Other { name: &'a str, value: &'a str },
    Blank,
}

/// Classify one line (content only, no terminator)
pub fn parse_field(line: &str) -> SseField<'_> {
    if line.is_empty() {
        return SseField::Blank;
    }
    if let Some(comment) = line.strip_prefix(':') {
        return SseField::Comment(comment.strip_prefix(' ').unwrap_or(comment));
    }

    let (name, value) = match line.find(':') {
        Some(idx) => {
            let value = &line[idx + 1..];
            (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
        }
        None => (line, ""),
    };

    match name {
        "event" => SseField::Event(value),
        "data" => SseField::Data(value),
        "id" => SseField::Id(value),
        "retry" => SseField::Retry(value),
        _ => SseField::Other { name, value },
    }
}

/// A dispatched event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn new<E: Into<String>, D: Into<String>>(event: E, data: D) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Event type, defaulting to `message` as browsers do
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    /// Serialize into wire format, one `data:` line per payload line
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(ref id) = self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(ref event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {}\n", retry));
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Encode a comment frame (used for keepalives)
pub fn encode_comment(text: &str) -> Bytes {
    Bytes::from(format!(": {}\n\n", text))
}

/// Folds fields into events
#[derive(Debug, Default)]
pub struct EventBuilder {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one field; a blank line dispatches the event if it carried data
    pub fn push(&mut self, field: SseField<'_>) -> Option<SseEvent> {
        match field {
            SseField::Event(name) => self.event = Some(name.to_string()),
            SseField::Data(value) => match self.data {
                Some(ref mut data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            SseField::Id(id) => self.id = Some(id.to_string()),
            SseField::Retry(value) => self.retry = value.trim().parse().ok(),
            SseField::Comment(_) | SseField::Other { .. } => {}
            SseField::Blank => return self.dispatch(),
        }
        None
    }

    /// Event type seen so far for the event being built
    pub fn current_event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        self.data.take().map(|data| SseEvent {
            event,
            data,
            id,
            retry,
        })
    }
}

/// Bytes in, events out
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineDecoder,
    builder: EventBuilder,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            lines: LineDecoder::with_max_line(max_line),
            builder: EventBuilder::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, LineTooLong> {
        let mut events = Vec::new();
        for line in self.lines.feed(chunk)? {
            let text = line.text();
            if let Some(event) = self.builder.push(parse_field(&text)) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// End of stream: flush a partial line and any undispatched event
    pub fn finish(&mut self) -> Option<SseEvent> {
        if let Some(line) = self.lines.finish() {
            let text = line.text();
            if let Some(event) = self.builder.push(parse_field(&text)) {
                return Some(event);
            }
        }
        self.builder.push(SseField::Blank)
    }
}

#[cfg(test)]
mod sse_test;
