//! Shared machinery behind every provider stream adapter.
//!
//! An adapter is a [`WireFormat`] (how one provider frames and encodes its
//! stream) plugged into a common pipeline:
//!
//! ```text
//! HTTP body bytes → LineBuffer → framing → WireFormat::decode → WireDecoder → StreamEvent
//! ```
//!
//! [`WireDecoder`] owns the per-stream state machine
//! (`Connecting → Streaming → Completed | Failed | Cancelled`), the
//! malformed-unit budget and cumulative→delta normalization. [`pump`] drives
//! a decoder from any byte stream while watching for cancellation and the
//! turn deadline.

use std::fmt::Display;
use std::time::Duration;

use futures::{Stream, StreamExt};
use quill_config::StreamConfig;
use quill_core::cancel::CancelSignal;
use quill_core::error::StreamFailure;
use quill_core::provider::{IncrementalToken, StreamEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How a provider delimits units in its response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One JSON object per line.
    NdJson,
    /// Server-sent events; each `data:` line carries one payload.
    Sse,
}

/// One decoded wire unit, already mapped out of the provider's JSON shape.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    /// Text added since the previous unit.
    Delta(String),
    /// Full response text so far.
    Snapshot(String),
    /// Explicit end-of-stream marker.
    Done,
    /// Provider-reported error, message kept verbatim.
    UpstreamError(String),
    /// Well-formed unit that carries no text (keep-alives, metadata).
    Ignore,
}

/// A provider family's wire protocol.
pub trait WireFormat: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn framing(&self) -> Framing;

    /// Decode one payload. `Err` marks the unit as malformed.
    fn decode(&self, payload: &str) -> Result<Vec<WireEvent>, String>;
}

/// Lifecycle of one provider stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl AdapterState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Bounds applied to every provider stream.
#[derive(Debug, Clone)]
pub struct StreamLimits {
    /// Ceiling on total time from open to the terminal event.
    pub max_duration: Duration,
    pub connect_timeout: Duration,
    pub max_consecutive_malformed: usize,
    pub channel_capacity: usize,
    pub keep_raw: bool,
}

impl StreamLimits {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            max_duration: Duration::from_secs(config.turn_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            max_consecutive_malformed: config.max_consecutive_malformed.max(1),
            channel_capacity: config.channel_capacity.max(1),
            keep_raw: config.keep_provider_raw,
        }
    }
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// Accumulates raw bytes and hands out complete lines.
///
/// Buffering is byte-level so a UTF-8 sequence split across two network
/// reads is decoded only once it is whole.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next `\n`-terminated line, without the terminator (and any `\r`).
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left once the transport has closed.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Turns full-text-so-far snapshots into true deltas.
#[derive(Debug, Default)]
pub struct DeltaNormalizer {
    seen: String,
}

impl DeltaNormalizer {
    pub fn snapshot(&mut self, full: &str) -> String {
        if let Some(suffix) = full.strip_prefix(self.seen.as_str()) {
            let delta = suffix.to_string();
            self.seen = full.to_string();
            return delta;
        }

        // Earlier text was rewritten. Emit from the first divergent char;
        // text already delivered cannot be retracted.
        let common = self
            .seen
            .char_indices()
            .zip(full.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((i, a), _)| i + a.len_utf8());
        warn!(
            delivered = self.seen.len(),
            common, "Snapshot diverged from delivered text"
        );
        let delta = full[common..].to_string();
        self.seen = full.to_string();
        delta
    }
}

/// Per-stream state machine: framing, decoding, normalization, malformed
/// budget and terminal detection.
///
/// Once the decoder reaches a terminal state it emits nothing further.
pub struct WireDecoder<F: WireFormat> {
    format: F,
    lines: LineBuffer,
    normalizer: DeltaNormalizer,
    state: AdapterState,
    malformed_run: usize,
    max_malformed: usize,
    keep_raw: bool,
}

impl<F: WireFormat> WireDecoder<F> {
    pub fn new(format: F, limits: &StreamLimits) -> Self {
        Self {
            format,
            lines: LineBuffer::default(),
            normalizer: DeltaNormalizer::default(),
            state: AdapterState::Connecting,
            malformed_run: 0,
            max_malformed: limits.max_consecutive_malformed,
            keep_raw: limits.keep_raw,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// Feed one network read. Returns the events it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.state.is_terminal() {
            return out;
        }
        self.lines.push(bytes);
        while let Some(line) = self.lines.next_line() {
            self.line(&line, &mut out);
            if self.state.is_terminal() {
                break;
            }
        }
        out
    }

    /// The transport closed cleanly. Parses any unterminated final unit,
    /// then completes the stream if nothing else ended it.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.state.is_terminal() {
            return out;
        }
        if let Some(rest) = self.lines.take_remainder() {
            self.line(&rest, &mut out);
        }
        if !self.state.is_terminal() {
            self.state = AdapterState::Completed;
            out.push(StreamEvent::Token(IncrementalToken::finished()));
        }
        out
    }

    /// Mark the stream failed from outside (transport error, timeout).
    pub fn fail(&mut self, failure: StreamFailure) -> Option<StreamEvent> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = AdapterState::Failed;
        Some(StreamEvent::Failed(failure))
    }

    pub fn cancel(&mut self) -> Option<StreamEvent> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = AdapterState::Cancelled;
        Some(StreamEvent::Cancelled)
    }

    fn line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        let payload = match self.format.framing() {
            Framing::NdJson => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return;
                }
                trimmed
            }
            Framing::Sse => {
                if line.is_empty() || line.starts_with(':') {
                    return;
                }
                match line.strip_prefix("data:") {
                    Some(data) => data.trim(),
                    // event:, id:, retry: carry nothing we need
                    None if line.starts_with("event:")
                        || line.starts_with("id:")
                        || line.starts_with("retry:") =>
                    {
                        return;
                    }
                    None => {
                        self.malformed(line, "not an SSE field", out);
                        return;
                    }
                }
            }
        };
        if payload.is_empty() {
            return;
        }

        match self.format.decode(payload) {
            Ok(events) => {
                self.malformed_run = 0;
                if self.state == AdapterState::Connecting {
                    self.state = AdapterState::Streaming;
                }
                let raw = if self.keep_raw {
                    serde_json::from_str::<serde_json::Value>(payload).ok()
                } else {
                    None
                };
                for event in events {
                    self.apply(event, raw.as_ref(), out);
                    if self.state.is_terminal() {
                        return;
                    }
                }
            }
            Err(reason) => self.malformed(payload, &reason, out),
        }
    }

    fn apply(
        &mut self,
        event: WireEvent,
        raw: Option<&serde_json::Value>,
        out: &mut Vec<StreamEvent>,
    ) {
        let text = match event {
            WireEvent::Delta(text) => text,
            WireEvent::Snapshot(full) => self.normalizer.snapshot(&full),
            WireEvent::Done => {
                self.state = AdapterState::Completed;
                out.push(StreamEvent::Token(IncrementalToken::finished()));
                return;
            }
            WireEvent::UpstreamError(message) => {
                debug!(provider = self.format.name(), %message, "Upstream reported an error");
                self.state = AdapterState::Failed;
                out.push(StreamEvent::Failed(StreamFailure::upstream(message)));
                return;
            }
            WireEvent::Ignore => return,
        };
        if text.is_empty() {
            return;
        }
        let mut token = IncrementalToken::delta(text);
        token.provider_raw = raw.cloned();
        out.push(StreamEvent::Token(token));
    }

    fn malformed(&mut self, unit: &str, reason: &str, out: &mut Vec<StreamEvent>) {
        self.malformed_run += 1;
        warn!(
            provider = self.format.name(),
            run = self.malformed_run,
            %reason,
            "Skipping malformed stream unit"
        );
        trace!(unit = %unit, "Malformed unit");
        if self.malformed_run >= self.max_malformed {
            self.state = AdapterState::Failed;
            out.push(StreamEvent::Failed(StreamFailure::malformed(format!(
                "{} consecutive malformed units from {}: {reason}",
                self.malformed_run,
                self.format.name()
            ))));
        }
    }
}

/// Drive `decoder` from `body` until a terminal state, forwarding events
/// to `tx`.
///
/// Cancellation and the deadline are checked before every read and while
/// waiting on a full channel. Terminal events never wait for room. Returning drops `body`, which closes the
/// underlying transport.
pub async fn pump<F, S, B, E>(
    mut decoder: WireDecoder<F>,
    body: S,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &mut CancelSignal,
    deadline: Instant,
) -> AdapterState
where
    F: WireFormat,
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = std::pin::pin!(body);

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Some(event) = decoder.cancel() {
                    let _ = tx.try_send(event);
                }
                return decoder.state();
            }
            _ = tokio::time::sleep_until(deadline) => return timed_out(&mut decoder, tx),
            read = body.next() => read,
        };

        let events = match read {
            Some(Ok(bytes)) => decoder.feed(bytes.as_ref()),
            Some(Err(e)) => decoder
                .fail(StreamFailure::transport(e.to_string()))
                .into_iter()
                .collect(),
            None => decoder.finish(),
        };

        for event in events {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Some(event) = decoder.cancel() {
                        let _ = tx.try_send(event);
                    }
                    return decoder.state();
                }
                _ = tokio::time::sleep_until(deadline) => return timed_out(&mut decoder, tx),
                sent = tx.send(event) => {
                    if sent.is_err() {
                        // Nobody is listening; stop reading.
                        decoder.cancel();
                        return decoder.state();
                    }
                }
            }
        }

        if decoder.state().is_terminal() {
            return decoder.state();
        }
    }
}

/// Fail the stream on deadline. The terminal event is only delivered if
/// the channel has room; a stalled consumer must not hold the transport.
fn timed_out<F: WireFormat>(
    decoder: &mut WireDecoder<F>,
    tx: &mpsc::Sender<StreamEvent>,
) -> AdapterState {
    warn!(provider = decoder.format.name(), "Turn deadline reached; closing stream");
    if let Some(event) = decoder.fail(StreamFailure::timeout("turn exceeded its time limit")) {
        let _ = tx.try_send(event);
    }
    decoder.state()
}

/// Open an HTTP stream for `format` on a background task.
///
/// Non-success responses become `Failed{Upstream}`; the provider's own
/// error message is extracted from the body when the format recognises it.
pub(crate) fn spawn_http_stream<F: WireFormat>(
    format: F,
    request: reqwest::RequestBuilder,
    limits: StreamLimits,
    mut cancel: CancelSignal,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(limits.channel_capacity);

    tokio::spawn(async move {
        let provider = format.name();
        let deadline = Instant::now() + limits.max_duration;

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tx.try_send(StreamEvent::Cancelled);
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = tx.try_send(StreamEvent::Failed(StreamFailure::timeout(
                    "no response before the turn deadline",
                )));
                return;
            }
            sent = request.send() => sent,
        };

        let response = match sent {
            Ok(r) => r,
            Err(e) => {
                warn!(provider, error = %e, "Provider connection failed");
                let _ = tx
                    .send(StreamEvent::Failed(StreamFailure::transport(e.to_string())))
                    .await;
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = upstream_message(&format, &body)
                .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body.trim()));
            warn!(provider, status = status.as_u16(), %message, "Provider returned an error");
            let _ = tx
                .send(StreamEvent::Failed(StreamFailure::upstream(message)))
                .await;
            return;
        }

        debug!(provider, "Provider stream open");
        let decoder = WireDecoder::new(format, &limits);
        let state = pump(decoder, response.bytes_stream(), &tx, &mut cancel, deadline).await;
        debug!(provider, ?state, "Provider stream closed");
    });

    rx
}

/// Provider error message embedded in a non-streaming error body.
fn upstream_message<F: WireFormat>(format: &F, body: &str) -> Option<String> {
    let body = body.trim();
    let body = body.strip_prefix("data:").map_or(body, str::trim);
    format.decode(body).ok()?.into_iter().find_map(|e| match e {
        WireEvent::UpstreamError(message) => Some(message),
        _ => None,
    })
}

pub(crate) fn http_client(limits: &StreamLimits) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(limits.connect_timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Run `chunks` through a decoder as if they were network reads.
    pub fn decode_all<F: WireFormat>(format: F, chunks: &[&str]) -> Vec<StreamEvent> {
        let mut decoder = WireDecoder::new(format, &StreamLimits::default());
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.feed(chunk.as_bytes()));
        }
        out.extend(decoder.finish());
        out
    }

    pub fn token(text: &str) -> StreamEvent {
        StreamEvent::Token(IncrementalToken::delta(text))
    }

    pub fn done() -> StreamEvent {
        StreamEvent::Token(IncrementalToken::finished())
    }

    /// Serve one HTTP response on a loopback port, writing `chunks` as
    /// separate writes. Returns the base URL and a handle yielding the raw
    /// request that was received.
    pub async fn serve_once(
        status: &'static str,
        content_type: &'static str,
        chunks: Vec<String>,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n"
            );
            let _ = socket.write_all(head.as_bytes()).await;
            for chunk in chunks {
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    break;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{addr}"), handle)
    }

    pub async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use quill_core::cancel::CancelHandle;
    use quill_core::error::FailureReason;

    /// Payload is the text itself; `!` ends, `?` errors, `#` is garbage.
    struct Plain(Framing);

    impl WireFormat for Plain {
        fn name(&self) -> &'static str {
            "plain"
        }

        fn framing(&self) -> Framing {
            self.0
        }

        fn decode(&self, payload: &str) -> Result<Vec<WireEvent>, String> {
            match payload {
                "!" => Ok(vec![WireEvent::Done]),
                "#" => Err("garbage".into()),
                "." => Ok(vec![WireEvent::Ignore]),
                p if p.starts_with('?') => Ok(vec![WireEvent::UpstreamError(p[1..].into())]),
                p if p.starts_with('=') => Ok(vec![WireEvent::Snapshot(p[1..].into())]),
                p => Ok(vec![WireEvent::Delta(p.into())]),
            }
        }
    }

    #[test]
    fn line_buffer_holds_partial_lines() {
        let mut buf = LineBuffer::default();
        buf.push(b"data: one\r\nda");
        assert_eq!(buf.next_line().as_deref(), Some("data: one"));
        assert_eq!(buf.next_line(), None);
        buf.push(b"ta: two\n");
        assert_eq!(buf.next_line().as_deref(), Some("data: two"));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn line_buffer_reassembles_split_utf8() {
        let bytes = "héllo\n".as_bytes();
        let mut buf = LineBuffer::default();
        buf.push(&bytes[..2]);
        assert_eq!(buf.next_line(), None);
        buf.push(&bytes[2..]);
        assert_eq!(buf.next_line().as_deref(), Some("héllo"));
    }

    #[test]
    fn normalizer_emits_suffixes() {
        let mut n = DeltaNormalizer::default();
        assert_eq!(n.snapshot("Hi"), "Hi");
        assert_eq!(n.snapshot("Hi there"), " there");
        assert_eq!(n.snapshot("Hi there"), "");
    }

    #[test]
    fn normalizer_handles_rewrites() {
        let mut n = DeltaNormalizer::default();
        n.snapshot("Hello wor");
        assert_eq!(n.snapshot("Hello world"), "ld");
        assert_eq!(n.snapshot("Hello, world!"), ", world!");
    }

    #[test]
    fn decoder_streams_then_completes_on_sentinel() {
        let events = decode_all(Plain(Framing::NdJson), &["a\nb", "\n!\nc\n"]);
        assert_eq!(events, vec![token("a"), token("b"), done()]);
    }

    #[test]
    fn decoder_completes_on_clean_close() {
        let events = decode_all(Plain(Framing::NdJson), &["a\n", "tail"]);
        assert_eq!(events, vec![token("a"), token("tail"), done()]);
    }

    #[test]
    fn decoder_normalizes_snapshots() {
        let events = decode_all(Plain(Framing::NdJson), &["=Hi\n=Hi there\n"]);
        assert_eq!(events, vec![token("Hi"), token(" there"), done()]);
    }

    #[test]
    fn first_unit_error_fails_verbatim() {
        let mut decoder = WireDecoder::new(Plain(Framing::Sse), &StreamLimits::default());
        assert_eq!(decoder.state(), AdapterState::Connecting);
        let events = decoder.feed(b"data: ?model `x` not found\n\ndata: late\n");
        assert_eq!(
            events,
            vec![StreamEvent::Failed(StreamFailure::upstream("model `x` not found"))]
        );
        assert_eq!(decoder.state(), AdapterState::Failed);
        assert!(decoder.feed(b"data: more\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn isolated_malformed_units_are_skipped() {
        let events = decode_all(Plain(Framing::NdJson), &["a\n#\n#\nb\n#\n!\n"]);
        assert_eq!(events, vec![token("a"), token("b"), done()]);
    }

    #[test]
    fn three_consecutive_malformed_units_fail() {
        let events = decode_all(Plain(Framing::NdJson), &["a\n#\n#\n#\nb\n"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], token("a"));
        match &events[1] {
            StreamEvent::Failed(f) => assert_eq!(f.reason, FailureReason::MalformedStream),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn sse_framing_skips_comments_and_fields() {
        let events = decode_all(
            Plain(Framing::Sse),
            &[": keep-alive\nevent: delta\nid: 7\ndata: x\n\n", "data: .\n\ndata: !\n\n"],
        );
        assert_eq!(events, vec![token("x"), done()]);
    }

    #[test]
    fn raw_payload_is_attached_when_enabled() {
        struct Json;
        impl WireFormat for Json {
            fn name(&self) -> &'static str {
                "json"
            }
            fn framing(&self) -> Framing {
                Framing::NdJson
            }
            fn decode(&self, payload: &str) -> Result<Vec<WireEvent>, String> {
                let v: serde_json::Value =
                    serde_json::from_str(payload).map_err(|e| e.to_string())?;
                Ok(vec![WireEvent::Delta(v["t"].as_str().unwrap_or("").into())])
            }
        }

        let limits = StreamLimits {
            keep_raw: true,
            ..StreamLimits::default()
        };
        let mut decoder = WireDecoder::new(Json, &limits);
        let events = decoder.feed(b"{\"t\":\"hey\"}\n");
        match &events[0] {
            StreamEvent::Token(t) => {
                assert_eq!(t.delta_text, "hey");
                assert_eq!(t.provider_raw, Some(serde_json::json!({"t": "hey"})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, String>> + use<> {
        let items: Vec<Result<Vec<u8>, String>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures::stream::iter(items)
    }

    #[tokio::test]
    async fn pump_forwards_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let decoder = WireDecoder::new(Plain(Framing::NdJson), &StreamLimits::default());
        let mut signal = CancelSignal::never();
        let deadline = Instant::now() + Duration::from_secs(5);
        let state = pump(decoder, chunks(&["a\nb\n", "c\n!\n"]), &tx, &mut signal, deadline).await;
        drop(tx);

        assert_eq!(state, AdapterState::Completed);
        assert_eq!(
            collect(rx).await,
            vec![token("a"), token("b"), token("c"), done()]
        );
    }

    #[tokio::test]
    async fn pump_reports_transport_errors() {
        let (tx, rx) = mpsc::channel(4);
        let decoder = WireDecoder::new(Plain(Framing::NdJson), &StreamLimits::default());
        let body = futures::stream::iter(vec![
            Ok(b"a\n".to_vec()),
            Err("connection reset".to_string()),
        ]);
        let mut signal = CancelSignal::never();
        let deadline = Instant::now() + Duration::from_secs(5);
        let state = pump(decoder, body, &tx, &mut signal, deadline).await;
        drop(tx);

        assert_eq!(state, AdapterState::Failed);
        let events = collect(rx).await;
        assert_eq!(events[0], token("a"));
        assert_eq!(
            events[1],
            StreamEvent::Failed(StreamFailure::transport("connection reset"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pump_times_out_on_stalled_stream() {
        let (tx, rx) = mpsc::channel(4);
        let decoder = WireDecoder::new(Plain(Framing::NdJson), &StreamLimits::default());
        let body = chunks(&["a\n"]).chain(futures::stream::pending());
        let mut signal = CancelSignal::never();
        let deadline = Instant::now() + Duration::from_secs(2);
        let state = pump(decoder, body, &tx, &mut signal, deadline).await;
        drop(tx);

        assert_eq!(state, AdapterState::Failed);
        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            StreamEvent::Failed(f) => assert_eq!(f.reason, FailureReason::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pump_deadline_holds_when_consumer_stalls() {
        let (tx, mut rx) = mpsc::channel(1);
        let decoder = WireDecoder::new(Plain(Framing::NdJson), &StreamLimits::default());
        let body = chunks(&["a\nb\nc\nd\n"]).chain(futures::stream::pending());
        let mut signal = CancelSignal::never();
        let deadline = Instant::now() + Duration::from_millis(200);

        // Nobody reads `rx` until the pump has given up.
        let state = tokio::time::timeout(
            Duration::from_secs(3),
            pump(decoder, body, &tx, &mut signal, deadline),
        )
        .await
        .expect("pump must return once the deadline passes");
        drop(tx);

        assert_eq!(state, AdapterState::Failed);
        assert_eq!(rx.recv().await, Some(token("a")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn pump_stops_on_cancel() {
        let (tx, rx) = mpsc::channel(4);
        let decoder = WireDecoder::new(Plain(Framing::NdJson), &StreamLimits::default());
        let handle = CancelHandle::new();
        let mut signal = handle.signal();
        let body = chunks(&["a\n"]).chain(futures::stream::pending());
        let deadline = Instant::now() + Duration::from_secs(60);

        let task = tokio::spawn(async move { pump(decoder, body, &tx, &mut signal, deadline).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let state = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, AdapterState::Cancelled);
        assert_eq!(collect(rx).await, vec![token("a"), StreamEvent::Cancelled]);
    }
}
