//! Wire format adapters: turn a chunked byte stream into ordered [`StreamEvent`]s.
//!
//! Both formats are line-oriented. Bytes are buffered until a full line is available, so a
//! line may arrive split across any number of reads. Each line yields at most one event and
//! nothing is produced after a terminal event.

use serde::Deserialize;
use serde_json::Value;

use crate::event::{Progress, StreamError, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Newline-delimited JSON (Ollama chat, generate and pull).
    Ndjson,
    /// Server-sent events with OpenAI-style chunk payloads.
    Sse,
}

impl WireFormat {
    pub fn adapter(self) -> Box<dyn FormatAdapter + Send> {
        match self {
            WireFormat::Ndjson => Box::new(NdjsonAdapter::new()),
            WireFormat::Sse => Box::new(SseAdapter::new()),
        }
    }
}

pub trait FormatAdapter {
    /// Feed the next read. Returns events for every line completed by it.
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent>;

    /// End of body. Flushes a trailing unterminated line and synthesizes `Done` if the
    /// stream never produced a terminal event.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Splits bytes into lines on `\n`, dropping a trailing `\r`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Whatever is left after the last newline.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn error_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Drives a per-line parser through a [`LineBuffer`] and enforces terminal ordering.
struct LineDriver {
    lines: LineBuffer,
    finished: bool,
}

impl LineDriver {
    fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            finished: false,
        }
    }

    fn feed(&mut self, bytes: &[u8], parse: fn(&str) -> Option<StreamEvent>) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let lines = self.lines.push(bytes);
        self.run(lines, parse)
    }

    fn finish(&mut self, parse: fn(&str) -> Option<StreamEvent>) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let rest: Vec<String> = self.lines.take_rest().into_iter().collect();
        let mut out = self.run(rest, parse);
        if !self.finished {
            self.finished = true;
            out.push(StreamEvent::Done);
        }
        out
    }

    fn run(&mut self, lines: Vec<String>, parse: fn(&str) -> Option<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for line in lines {
            if let Some(event) = parse(&line) {
                let terminal = event.is_terminal();
                out.push(event);
                if terminal {
                    self.finished = true;
                    break;
                }
            }
        }
        out
    }
}

#[derive(Deserialize)]
struct NdjsonLine {
    #[serde(default)]
    done: bool,
    message: Option<NdjsonMessage>,
    response: Option<String>,
    status: Option<String>,
    digest: Option<String>,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct NdjsonMessage {
    content: Option<String>,
}

/// One JSON object per line.
pub struct NdjsonAdapter {
    driver: LineDriver,
}

impl NdjsonAdapter {
    pub fn new() -> Self {
        Self {
            driver: LineDriver::new(),
        }
    }

    fn parse_line(line: &str) -> Option<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let parsed: NdjsonLine = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparsable ndjson line");
                return None;
            }
        };
        if let Some(err) = parsed.error {
            return Some(StreamEvent::Error(StreamError::Provider(error_message(&err))));
        }
        if parsed.done {
            return Some(StreamEvent::Done);
        }
        if let Some(content) = parsed.message.and_then(|m| m.content) {
            if !content.is_empty() {
                return Some(StreamEvent::Delta(content));
            }
        }
        if let Some(response) = parsed.response {
            if !response.is_empty() {
                return Some(StreamEvent::Delta(response));
            }
        }
        parsed.status.map(|status| {
            StreamEvent::Progress(Progress {
                status,
                digest: parsed.digest,
                total: parsed.total,
                completed: parsed.completed,
            })
        })
    }
}

impl Default for NdjsonAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatAdapter for NdjsonAdapter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.driver.feed(bytes, Self::parse_line)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.driver.finish(Self::parse_line)
    }
}

/// Terminal sentinel carried in a `data:` line.
pub const SSE_DONE: &str = "[DONE]";

#[derive(Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct SseChoice {
    delta: Option<SseDelta>,
}

#[derive(Deserialize)]
struct SseDelta {
    content: Option<String>,
}

/// `data: <payload>` lines; everything else is ignored.
pub struct SseAdapter {
    driver: LineDriver,
}

impl SseAdapter {
    pub fn new() -> Self {
        Self {
            driver: LineDriver::new(),
        }
    }

    fn parse_line(line: &str) -> Option<StreamEvent> {
        let payload = line.strip_prefix("data:")?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();
        if payload == SSE_DONE {
            return Some(StreamEvent::Done);
        }
        let chunk: SseChunk = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed sse payload");
                return None;
            }
        };
        if let Some(err) = chunk.error {
            return Some(StreamEvent::Error(StreamError::Provider(error_message(&err))));
        }
        chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|c| !c.is_empty())
            .map(StreamEvent::Delta)
    }
}

impl Default for SseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatAdapter for SseAdapter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.driver.feed(bytes, Self::parse_line)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.driver.finish(Self::parse_line)
    }
}
