use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use recall_core::errors::ModelCallError;
use recall_core::provider::ByteStream;
use recall_core::stream::DecodedEvent;
use recall_core::tokens::TokenUsage;

use crate::parser::{self, BraceScanner, Envelope, LEADING_THINK_WINDOW, THINK_CLOSE, THINK_OPEN};

/// Envelope bytes held back before giving up and releasing them as prose.
const MAX_ENVELOPE_HOLDBACK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkState {
    /// Start of the turn. Content is held until it is clear whether it ends
    /// with a `</think>` whose opener the provider dropped.
    Leading,
    Normal,
    InThinking,
}

/// Single-pass decoder for one OpenAI-compatible chat-completions SSE body.
///
/// Not reusable: create a fresh decoder for every model call.
pub struct StreamDecoder {
    line_buf: Vec<u8>,
    state: ThinkState,
    /// Possible partial `<think>` / `</think>` tag carried to the next delta,
    /// or the whole turn so far while `Leading`.
    tag_holdback: String,
    envelope: Option<Capture>,
    raw_content: String,
    reasoning: String,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            line_buf: Vec::new(),
            state: ThinkState::Leading,
            tag_holdback: String::new(),
            envelope: None,
            raw_content: String::new(),
            reasoning: String::new(),
            usage: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes. Lines may be split anywhere, including inside a UTF-8 sequence.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<DecodedEvent>, ModelCallError> {
        let mut events = Vec::new();
        if self.finished {
            return Ok(events);
        }
        self.line_buf.extend_from_slice(chunk);

        while let Some(pos) = self.line_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.process_line(line.trim_end_matches(['\r', '\n']), &mut events)?;
            if self.finished {
                self.line_buf.clear();
                break;
            }
        }
        Ok(events)
    }

    /// Flush held-back text and emit `Done`. Idempotent.
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.line_buf.is_empty() {
            let rest = std::mem::take(&mut self.line_buf);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Err(e) = self.process_line(line.trim_end_matches('\r'), &mut events) {
                warn!(error = %e, "ignoring provider error in trailing partial line");
            }
            if self.finished {
                return events;
            }
        }
        self.complete(&mut events);
        events
    }

    fn complete(&mut self, events: &mut Vec<DecodedEvent>) {
        let held = std::mem::take(&mut self.tag_holdback);
        match self.state {
            ThinkState::InThinking => {
                if !held.is_empty() {
                    events.push(DecodedEvent::ThinkContent { delta: held });
                }
                events.push(DecodedEvent::ThinkEnd);
                self.state = ThinkState::Normal;
            }
            ThinkState::Leading | ThinkState::Normal => self.emit_visible(&held, events),
        }
        while let Some(capture) = self.envelope.take() {
            debug!(len = capture.text.len(), "releasing unterminated JSON as content");
            let rest = release(capture, "", events);
            self.emit_visible(&rest, events);
        }

        let reasoning = (!self.reasoning.trim().is_empty()).then_some(self.reasoning.as_str());
        let result = parser::parse_response(&self.raw_content, reasoning);
        events.push(DecodedEvent::Done { result, usage: self.usage });
        self.finished = true;
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<DecodedEvent>) -> Result<(), ModelCallError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim_start();
        if data.is_empty() {
            return Ok(());
        }
        if data == "[DONE]" {
            self.complete(events);
            return Ok(());
        }

        let chunk: ChunkPayload = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping unparseable SSE data line");
                return Ok(());
            }
        };

        if let Some(err) = chunk.error {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| err.to_string(), str::to_string);
            return Err(ModelCallError::ServerError { status: 500, body: message });
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        for choice in chunk.choices {
            let Some(delta) = choice.delta else { continue };
            if let Some(r) = delta.reasoning.or(delta.reasoning_content).filter(|r| !r.is_empty()) {
                self.reasoning.push_str(&r);
                events.push(DecodedEvent::Reasoning { delta: r });
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                self.raw_content.push_str(&content);
                self.process_content(&content, events);
            }
        }
        Ok(())
    }

    fn process_content(&mut self, delta: &str, events: &mut Vec<DecodedEvent>) {
        let mut buf = std::mem::take(&mut self.tag_holdback);
        buf.push_str(delta);

        loop {
            match self.state {
                ThinkState::Leading => {
                    let open = buf.find(THINK_OPEN);
                    match buf.find(THINK_CLOSE) {
                        Some(c) if c < LEADING_THINK_WINDOW && open.map_or(true, |o| c < o) => {
                            events.push(DecodedEvent::ThinkStart);
                            if c > 0 {
                                events.push(DecodedEvent::ThinkContent { delta: buf[..c].to_string() });
                            }
                            events.push(DecodedEvent::ThinkEnd);
                            self.state = ThinkState::Normal;
                            buf = buf[c + THINK_CLOSE.len()..].to_string();
                        }
                        _ if open.is_some() || buf.len() >= LEADING_THINK_WINDOW + THINK_CLOSE.len() => {
                            self.state = ThinkState::Normal;
                        }
                        _ => {
                            self.tag_holdback = buf;
                            return;
                        }
                    }
                }
                ThinkState::Normal => {
                    let open = buf.find(THINK_OPEN);
                    let stray_close = buf
                        .find(THINK_CLOSE)
                        .filter(|c| open.map_or(true, |o| *c < o));
                    match (stray_close, open) {
                        (Some(c), _) => {
                            self.emit_visible(&buf[..c], events);
                            buf = buf[c + THINK_CLOSE.len()..].to_string();
                        }
                        (None, Some(o)) => {
                            self.emit_visible(&buf[..o], events);
                            events.push(DecodedEvent::ThinkStart);
                            self.state = ThinkState::InThinking;
                            buf = buf[o + THINK_OPEN.len()..].to_string();
                        }
                        (None, None) => {
                            let keep = partial_tag_suffix(&buf, &[THINK_OPEN, THINK_CLOSE]);
                            let split = buf.len() - keep;
                            self.emit_visible(&buf[..split], events);
                            self.tag_holdback = buf[split..].to_string();
                            return;
                        }
                    }
                }
                ThinkState::InThinking => match buf.find(THINK_CLOSE) {
                    Some(c) => {
                        if c > 0 {
                            events.push(DecodedEvent::ThinkContent { delta: buf[..c].to_string() });
                        }
                        events.push(DecodedEvent::ThinkEnd);
                        self.state = ThinkState::Normal;
                        buf = buf[c + THINK_CLOSE.len()..].to_string();
                    }
                    None => {
                        let keep = partial_tag_suffix(&buf, &[THINK_CLOSE]);
                        let split = buf.len() - keep;
                        if split > 0 {
                            events.push(DecodedEvent::ThinkContent { delta: buf[..split].to_string() });
                        }
                        self.tag_holdback = buf[split..].to_string();
                        return;
                    }
                },
            }
        }
    }

    /// Route visible text through the envelope holdback.
    fn emit_visible(&mut self, text: &str, events: &mut Vec<DecodedEvent>) {
        let mut pending = text.to_string();
        while let Some(rescan) = self.scan_visible(&pending, events) {
            pending = rescan;
        }
    }

    /// Returns the text to scan again when a held-back `{` turned out not to
    /// open a JSON object.
    fn scan_visible(&mut self, text: &str, events: &mut Vec<DecodedEvent>) -> Option<String> {
        let mut prose_start = 0;
        for (i, c) in text.char_indices() {
            let next = i + c.len_utf8();
            let Some(mut capture) = self.envelope.take() else {
                if c == '{' {
                    if i > prose_start {
                        events.push(DecodedEvent::Content { delta: text[prose_start..i].to_string() });
                    }
                    self.envelope = Some(Capture::open());
                    prose_start = next;
                }
                continue;
            };
            prose_start = next;
            match capture.push(c) {
                CaptureStep::Open if capture.text.len() > MAX_ENVELOPE_HOLDBACK => {
                    events.push(DecodedEvent::Content { delta: capture.text });
                }
                CaptureStep::Open => self.envelope = Some(capture),
                CaptureStep::Closed => match serde_json::from_str::<Value>(&capture.text) {
                    Ok(value) => events.push(envelope_event(&value, capture.text)),
                    Err(_) => return Some(release(capture, &text[next..], events)),
                },
                CaptureStep::Rejected => return Some(release(capture, &text[next..], events)),
            }
        }
        if self.envelope.is_none() && prose_start < text.len() {
            events.push(DecodedEvent::Content { delta: text[prose_start..].to_string() });
        }
        None
    }
}

/// Visible text held back from an opening `{` until the object closes or
/// cannot be JSON.
struct Capture {
    text: String,
    scanner: BraceScanner,
    keyed: bool,
}

enum CaptureStep {
    Open,
    Closed,
    Rejected,
}

impl Capture {
    fn open() -> Self {
        let mut scanner = BraceScanner::default();
        scanner.feed('{');
        Self {
            text: "{".to_string(),
            scanner,
            keyed: false,
        }
    }

    fn push(&mut self, c: char) -> CaptureStep {
        self.text.push(c);
        if !self.keyed {
            if c.is_whitespace() {
                return CaptureStep::Open;
            }
            // A JSON object continues with a key or closes.
            if c != '"' && c != '}' {
                return CaptureStep::Rejected;
            }
            self.keyed = true;
        }
        if self.scanner.feed(c) {
            CaptureStep::Closed
        } else {
            CaptureStep::Open
        }
    }
}

/// Emit the opening brace as prose and return what follows it for rescanning.
fn release(capture: Capture, tail: &str, events: &mut Vec<DecodedEvent>) -> String {
    events.push(DecodedEvent::Content { delta: "{".to_string() });
    let mut rest = capture.text[1..].to_string();
    rest.push_str(tail);
    rest
}

fn envelope_event(value: &Value, captured: String) -> DecodedEvent {
    match parser::classify_envelope(value) {
        Some(Envelope::ToolCalls(calls)) if !calls.is_empty() => DecodedEvent::ToolCall { calls },
        Some(Envelope::Text(text)) => DecodedEvent::Content { delta: text },
        _ => DecodedEvent::Content { delta: captured },
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of any tag.
fn partial_tag_suffix(buf: &str, tags: &[&str]) -> usize {
    let mut longest = 0;
    for tag in tags {
        for n in (1..tag.len()).rev() {
            if n > longest && buf.ends_with(&tag[..n]) {
                longest = n;
                break;
            }
        }
    }
    longest
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChoicePayload>,
    #[serde(default)]
    usage: Option<UsagePayload>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ChoicePayload {
    #[serde(default)]
    delta: Option<DeltaPayload>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl From<UsagePayload> for TokenUsage {
    fn from(u: UsagePayload) -> Self {
        let mut usage = TokenUsage::new(u.prompt_tokens, u.completion_tokens);
        if let Some(total) = u.total_tokens {
            usage.total_tokens = total;
        }
        usage
    }
}

/// Drives a [`StreamDecoder`] over a provider byte stream.
///
/// The whole call shares one deadline; when it passes, the stream yields
/// [`ModelCallError::Timeout`] and ends. Nothing is yielded after `Done`.
pub struct DecodedStream {
    inner: ByteStream,
    decoder: StreamDecoder,
    pending: VecDeque<DecodedEvent>,
    deadline: Pin<Box<tokio::time::Sleep>>,
    timeout: Duration,
    ended: bool,
}

impl DecodedStream {
    pub fn new(inner: ByteStream, timeout: Duration) -> Self {
        Self {
            inner,
            decoder: StreamDecoder::new(),
            pending: VecDeque::new(),
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            ended: false,
        }
    }

    fn fail(&mut self, error: ModelCallError) -> Poll<Option<Result<DecodedEvent, ModelCallError>>> {
        self.ended = true;
        self.pending.clear();
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for DecodedStream {
    type Item = Result<DecodedEvent, ModelCallError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.pending.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }
        if self.ended || self.decoder.is_finished() {
            return Poll::Ready(None);
        }

        loop {
            if self.deadline.as_mut().poll(cx).is_ready() {
                let timeout = self.timeout;
                return self.fail(ModelCallError::Timeout(timeout));
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let events = match self.decoder.feed(&bytes) {
                        Ok(events) => events,
                        Err(e) => return self.fail(e),
                    };
                    self.pending.extend(events);
                    if let Some(event) = self.pending.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                    if self.decoder.is_finished() {
                        return Poll::Ready(None);
                    }
                }
                Poll::Ready(Some(Err(e))) => return self.fail(e),
                Poll::Ready(None) => {
                    let events = self.decoder.finish();
                    self.pending.extend(events);
                    return match self.pending.pop_front() {
                        Some(event) => Poll::Ready(Some(Ok(event))),
                        None => Poll::Ready(None),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
