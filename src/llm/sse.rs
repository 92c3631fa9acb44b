//! Incremental decoder for OpenAI-style server-sent-event streams.
//!
//! Bytes go in as they arrive from the transport, in chunks of any size. Text deltas come
//! out, one per `data:` payload, in stream order. The decoder keeps three pieces of state
//! between calls:
//!
//! - a UTF-8 tail, so a multi-byte character split across reads is decoded once whole;
//! - a line buffer, holding text after the last newline seen;
//! - an *incomplete record*: a `data:` payload whose JSON ended early. Later lines of the
//!   same event are joined to it with `\n` and the record is parsed again, so a payload the
//!   producer wrapped over several lines is emitted exactly once. The record is dropped when
//!   the event ends, when `[DONE]` arrives, when a fresh payload parses on its own, or when
//!   it outgrows [`MAX_INCOMPLETE_RECORD`].
//!
//! The same bound applies to the line buffer: a line still unterminated past it is discarded
//! up to its newline. Every dropped record is counted and kept as a [`ChatError::Decode`].

use crate::error::ChatError;
use log::{ debug, warn };
use serde::Deserialize;
use std::borrow::Cow;

/// Upper bound for a payload held across lines while waiting for the rest of its JSON, and
/// for a line held while waiting for its newline.
pub const MAX_INCOMPLETE_RECORD: usize = 64 * 1024;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A non-empty `choices[0].delta.content` fragment.
    Delta(String),
    /// The provider reported an error inside the stream (`{"error": {...}}`).
    Failed(String),
    /// `data: [DONE]` was received. Nothing follows.
    Done,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    message: Option<String>,
}

enum Parsed {
    Event(Option<SseEvent>),
    Incomplete,
    Malformed(ChatError),
}

fn parse_payload(payload: &str) -> Parsed {
    let value = match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(v) => v,
        Err(e) if e.is_eof() => {
            return Parsed::Incomplete;
        }
        Err(e) => {
            return Parsed::Malformed(e.into());
        }
    };

    let chunk = match serde_json::from_value::<StreamChunk>(value) {
        Ok(c) => c,
        Err(e) => {
            return Parsed::Malformed(e.into());
        }
    };

    if let Some(err) = chunk.error {
        let message = err.message.unwrap_or_else(|| "provider reported an error".to_string());
        return Parsed::Event(Some(SseEvent::Failed(message)));
    }

    let delta = chunk.choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|s| !s.is_empty());

    Parsed::Event(delta.map(SseEvent::Delta))
}

fn is_field_line(line: &str) -> bool {
    ["event", "id", "retry"].iter().any(|field| {
        line.strip_prefix(field).map_or(false, |rest| rest.is_empty() || rest.starts_with(':'))
    })
}

/// Stateful UTF-8 decoder. Bytes of a character that is cut off at the end of a chunk are
/// held back until the next call; invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);

        let mut out = String::with_capacity(data.len());
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes a truncated trailing sequence at end of input.
    pub fn flush(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let pending = std::mem::take(&mut self.pending);
        match String::from_utf8_lossy(&pending) {
            Cow::Borrowed(s) => s.to_string(),
            Cow::Owned(s) => s,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    buffer: String,
    incomplete: Option<String>,
    dropped_records: usize,
    last_error: Option<ChatError>,
    /// Set after an overlong line was cut; the rest of it up to the newline is skipped.
    skipping_line: bool,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk and returns the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        let text = self.utf8.decode(chunk);
        self.buffer.push_str(&text);

        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            if std::mem::take(&mut self.skipping_line) {
                continue;
            }
            self.process_line(&line, &mut events);
            if self.done {
                self.buffer.clear();
                break;
            }
        }

        if self.buffer.len() > MAX_INCOMPLETE_RECORD {
            let line = std::mem::take(&mut self.buffer);
            self.drop_incomplete("line too long");
            self.note_dropped(&line, ChatError::Decode("line too long".to_string()));
            self.skipping_line = true;
        }
        events
    }

    /// Called when the transport ends. A final line without a trailing newline is still
    /// processed; a record that never completed is dropped.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        let tail = self.utf8.flush();
        self.buffer.push_str(&tail);
        let rest = std::mem::take(&mut self.buffer);
        let skip = usize::from(std::mem::take(&mut self.skipping_line));
        for raw in rest.split('\n').skip(skip) {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            self.process_line(line, &mut events);
            if self.done {
                return events;
            }
        }
        self.drop_incomplete("stream ended");
        events
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The payload currently waiting for more lines, if any.
    pub fn incomplete_record(&self) -> Option<&str> {
        self.incomplete.as_deref()
    }

    /// Records dropped as unrecoverable since this decoder was created.
    pub fn dropped_records(&self) -> usize {
        self.dropped_records
    }

    /// Why the most recent record was dropped.
    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.drop_incomplete("event ended");
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let payload = match line.strip_prefix(DATA_PREFIX) {
            Some(rest) => rest.trim(),
            None => {
                if is_field_line(line) {
                    return;
                }
                match self.incomplete.take() {
                    Some(record) => self.continue_record(record, line.trim(), events),
                    None => debug!("Skipping non-data SSE line: {}", line),
                }
                return;
            }
        };

        if payload == DONE_SENTINEL {
            self.drop_incomplete("stream finished");
            self.done = true;
            events.push(SseEvent::Done);
            return;
        }

        if let Some(record) = self.incomplete.take() {
            match parse_payload(payload) {
                Parsed::Event(event) => {
                    self.note_dropped(
                        &record,
                        ChatError::Decode("superseded by a new record".to_string())
                    );
                    events.extend(event);
                }
                _ => self.continue_record(record, payload, events),
            }
            return;
        }

        match parse_payload(payload) {
            Parsed::Event(event) => events.extend(event),
            Parsed::Incomplete if payload.len() <= MAX_INCOMPLETE_RECORD => {
                self.incomplete = Some(payload.to_string());
            }
            Parsed::Incomplete => self.note_dropped(payload, record_too_large()),
            Parsed::Malformed(err) => self.note_dropped(payload, err),
        }
    }

    fn continue_record(&mut self, mut record: String, fragment: &str, events: &mut Vec<SseEvent>) {
        record.push('\n');
        record.push_str(fragment);
        match parse_payload(&record) {
            Parsed::Event(event) => events.extend(event),
            Parsed::Incomplete if record.len() <= MAX_INCOMPLETE_RECORD => {
                self.incomplete = Some(record);
            }
            Parsed::Incomplete => self.note_dropped(&record, record_too_large()),
            Parsed::Malformed(err) => self.note_dropped(&record, err),
        }
    }

    fn drop_incomplete(&mut self, reason: &str) {
        if let Some(record) = self.incomplete.take() {
            self.note_dropped(&record, ChatError::Decode(format!("unfinished record, {}", reason)));
        }
    }

    fn note_dropped(&mut self, record: &str, err: ChatError) {
        self.dropped_records += 1;
        let preview: String = record.chars().take(80).collect();
        warn!("Dropping SSE record ({}): {}", err, preview);
        self.last_error = Some(err);
    }
}

fn record_too_large() -> ChatError {
    ChatError::Decode(format!("record exceeds {} bytes", MAX_INCOMPLETE_RECORD))
}
