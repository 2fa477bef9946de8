//! Shared test helpers for engine tests.

use std::sync::Mutex;
use std::time::Duration;

use quill_core::cancel::CancelSignal;
use quill_core::provider::{
    IncrementalToken, NormalizedRequest, ProviderKind, StreamAdapter, StreamEvent,
};
use tokio::sync::mpsc;

/// An adapter that plays back a fixed list of events.
///
/// Honors cancellation between events. Every request it receives is kept
/// so tests can inspect what was sent.
pub struct ScriptedAdapter {
    name: String,
    events: Vec<StreamEvent>,
    delay: Duration,
    requests: Mutex<Vec<NormalizedRequest>>,
}

impl ScriptedAdapter {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            name: "scripted".into(),
            events,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Deltas followed by the completion marker.
    pub fn replying(parts: &[&str]) -> Self {
        let mut events: Vec<_> = parts.iter().map(|p| token(p)).collect();
        events.push(StreamEvent::Token(IncrementalToken::finished()));
        Self::new(events)
    }

    /// Pause before each event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<NormalizedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn token(text: &str) -> StreamEvent {
    StreamEvent::Token(IncrementalToken::delta(text))
}

#[async_trait::async_trait]
impl StreamAdapter for ScriptedAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompat
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        request: NormalizedRequest,
        mut cancel: CancelSignal,
    ) -> mpsc::Receiver<StreamEvent> {
        self.requests.lock().unwrap().push(request);
        let (tx, rx) = mpsc::channel(8);
        let events = self.events.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            for event in events {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.send(StreamEvent::Cancelled).await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}
