//! Stream multiplexer: hands each turn's normalized event stream to exactly
//! one subscriber and routes cancellation back to the producing adapter.
//!
//! A turn is registered with the adapter's receiver and the cancel handle
//! that stops it. The first `subscribe` takes the receiver; a second one
//! while the turn is open fails with `DuplicateSubscription`. The turn is
//! forgotten when its subscription is dropped. A turn nobody claims within
//! the claim timeout is cancelled and forgotten as well.
//!
//! A subscription always ends with exactly one terminal event. Cancelling
//! yields `Cancelled` even if the adapter never gets to say so, and nothing
//! is delivered after it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use quill_core::cancel::{CancelHandle, CancelSignal};
use quill_core::error::{StreamFailure, SubscribeError};
use quill_core::provider::{StreamEvent, TurnId};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// How long a registered turn may wait for its subscriber.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(120);

struct TurnSlot {
    /// Taken by the first subscriber.
    receiver: Option<mpsc::Receiver<StreamEvent>>,
    cancel: CancelHandle,
}

pub struct StreamMultiplexer {
    turns: Mutex<HashMap<TurnId, TurnSlot>>,
    claim_timeout: Duration,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self {
            turns: Mutex::new(HashMap::new()),
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }
}

impl StreamMultiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_claim_timeout(claim_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            claim_timeout,
            ..Self::default()
        })
    }

    fn turns(&self) -> MutexGuard<'_, HashMap<TurnId, TurnSlot>> {
        self.turns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make a turn's stream available for subscription.
    ///
    /// Must be called inside a tokio runtime; the claim timeout runs on it.
    pub fn register(
        self: &Arc<Self>,
        turn: TurnId,
        receiver: mpsc::Receiver<StreamEvent>,
        cancel: CancelHandle,
    ) {
        debug!(turn_id = %turn, "Turn registered");
        self.turns().insert(
            turn.clone(),
            TurnSlot {
                receiver: Some(receiver),
                cancel,
            },
        );

        let multiplexer = Arc::downgrade(self);
        let claim_timeout = self.claim_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(claim_timeout).await;
            if let Some(multiplexer) = multiplexer.upgrade() {
                multiplexer.release_unclaimed(&turn);
            }
        });
    }

    pub fn subscribe(self: &Arc<Self>, turn: &TurnId) -> Result<Subscription, SubscribeError> {
        let mut turns = self.turns();
        let slot = turns
            .get_mut(turn)
            .ok_or_else(|| SubscribeError::UnknownTurn(turn.to_string()))?;
        let receiver = slot
            .receiver
            .take()
            .ok_or_else(|| SubscribeError::DuplicateSubscription(turn.to_string()))?;

        Ok(Subscription {
            turn: turn.clone(),
            receiver,
            cancel: slot.cancel.signal(),
            finished: false,
            multiplexer: Arc::downgrade(self),
        })
    }

    /// Ask the turn's adapter to stop. The subscriber sees `Cancelled` next.
    pub fn cancel(&self, turn: &TurnId) -> Result<(), SubscribeError> {
        let turns = self.turns();
        let slot = turns
            .get(turn)
            .ok_or_else(|| SubscribeError::UnknownTurn(turn.to_string()))?;
        debug!(turn_id = %turn, "Cancelling turn");
        slot.cancel.cancel();
        Ok(())
    }

    /// Cancel every open turn.
    pub fn cancel_all(&self) {
        for slot in self.turns().values() {
            slot.cancel.cancel();
        }
    }

    pub fn is_open(&self, turn: &TurnId) -> bool {
        self.turns().contains_key(turn)
    }

    pub fn open_turns(&self) -> usize {
        self.turns().len()
    }

    fn release(&self, turn: &TurnId, finished: bool) {
        if let Some(slot) = self.turns().remove(turn) {
            if !finished {
                // Subscriber walked away mid-stream; stop the producer too.
                slot.cancel.cancel();
            }
        }
        trace!(turn_id = %turn, "Turn released");
    }

    /// Drop a turn that never got a subscriber, stopping its producer.
    fn release_unclaimed(&self, turn: &TurnId) {
        let mut turns = self.turns();
        let unclaimed = turns.get(turn).is_some_and(|slot| slot.receiver.is_some());
        if !unclaimed {
            return;
        }
        if let Some(slot) = turns.remove(turn) {
            warn!(turn_id = %turn, "Turn was never subscribed; releasing it");
            slot.cancel.cancel();
        }
    }
}

/// The single consumer of one turn.
pub struct Subscription {
    turn: TurnId,
    receiver: mpsc::Receiver<StreamEvent>,
    cancel: CancelSignal,
    finished: bool,
    multiplexer: Weak<StreamMultiplexer>,
}

impl Subscription {
    pub fn turn_id(&self) -> &TurnId {
        &self.turn
    }

    /// Next event in producer order, or `None` after the terminal event.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => StreamEvent::Cancelled,
            event = self.receiver.recv() => event.unwrap_or_else(|| {
                StreamEvent::Failed(StreamFailure::transport(
                    "stream ended without a terminal event",
                ))
            }),
        };

        if event.is_terminal() {
            self.finished = true;
            self.receiver.close();
        }
        Some(event)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.release(&self.turn, self.finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::provider::IncrementalToken;
    use std::time::Duration;

    fn token(text: &str) -> StreamEvent {
        StreamEvent::Token(IncrementalToken::delta(text))
    }

    fn done() -> StreamEvent {
        StreamEvent::Token(IncrementalToken::finished())
    }

    fn open_turn(mux: &Arc<StreamMultiplexer>) -> (TurnId, mpsc::Sender<StreamEvent>, CancelHandle) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancelHandle::new();
        let turn = TurnId::new();
        mux.register(turn.clone(), rx, cancel.clone());
        (turn, tx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_turn_is_released_and_cancelled() {
        let mux = StreamMultiplexer::with_claim_timeout(Duration::from_secs(1));
        let (turn, _tx, cancel) = open_turn(&mux);
        assert_eq!(mux.open_turns(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mux.open_turns(), 0);
        assert!(cancel.is_cancelled());
        assert!(matches!(
            mux.subscribe(&turn),
            Err(SubscribeError::UnknownTurn(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_turn_outlives_claim_timeout() {
        let mux = StreamMultiplexer::with_claim_timeout(Duration::from_secs(1));
        let (turn, tx, cancel) = open_turn(&mux);
        let mut sub = mux.subscribe(&turn).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(mux.is_open(&turn));
        assert!(!cancel.is_cancelled());

        tx.send(token("late")).await.unwrap();
        tx.send(done()).await.unwrap();
        assert_eq!(sub.recv().await, Some(token("late")));
        assert_eq!(sub.recv().await, Some(done()));
    }

    #[tokio::test]
    async fn delivers_in_producer_order() {
        let mux = StreamMultiplexer::new();
        let (turn, tx, _cancel) = open_turn(&mux);
        let mut sub = mux.subscribe(&turn).unwrap();

        for ev in [token("a"), token("b"), token("c"), done()] {
            tx.send(ev).await.unwrap();
        }
        let mut got = Vec::new();
        while let Some(ev) = sub.recv().await {
            got.push(ev);
        }
        assert_eq!(got, vec![token("a"), token("b"), token("c"), done()]);
    }

    #[tokio::test]
    async fn second_subscriber_is_rejected() {
        let mux = StreamMultiplexer::new();
        let (turn, _tx, _cancel) = open_turn(&mux);
        let _first = mux.subscribe(&turn).unwrap();
        assert_eq!(
            mux.subscribe(&turn).err(),
            Some(SubscribeError::DuplicateSubscription(turn.to_string()))
        );
    }

    #[tokio::test]
    async fn unknown_turn() {
        let mux = StreamMultiplexer::new();
        let turn = TurnId::new();
        assert!(matches!(
            mux.subscribe(&turn),
            Err(SubscribeError::UnknownTurn(_))
        ));
        assert!(matches!(mux.cancel(&turn), Err(SubscribeError::UnknownTurn(_))));
    }

    #[tokio::test]
    async fn cancel_ends_with_cancelled_and_nothing_after() {
        let mux = StreamMultiplexer::new();
        let (turn, tx, cancel) = open_turn(&mux);
        let mut sub = mux.subscribe(&turn).unwrap();

        tx.send(token("a")).await.unwrap();
        assert_eq!(sub.recv().await, Some(token("a")));

        mux.cancel(&turn).unwrap();
        assert!(cancel.is_cancelled());
        // the producer has not noticed yet and keeps sending
        let _ = tx.send(token("b")).await;

        let ev = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(ev, Some(StreamEvent::Cancelled));
        assert_eq!(sub.recv().await, None);
        assert!(tx.send(token("c")).await.is_err());
    }

    #[tokio::test]
    async fn producer_dropping_without_terminal_is_a_failure() {
        let mux = StreamMultiplexer::new();
        let (turn, tx, _cancel) = open_turn(&mux);
        let mut sub = mux.subscribe(&turn).unwrap();
        tx.send(token("partial")).await.unwrap();
        drop(tx);

        assert_eq!(sub.recv().await, Some(token("partial")));
        match sub.recv().await {
            Some(StreamEvent::Failed(f)) => {
                assert_eq!(f.reason, quill_core::error::FailureReason::TransportError)
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_subscription_releases_and_cancels() {
        let mux = StreamMultiplexer::new();
        let (turn, _tx, cancel) = open_turn(&mux);
        let sub = mux.subscribe(&turn).unwrap();
        assert!(mux.is_open(&turn));

        drop(sub);
        assert!(!mux.is_open(&turn));
        assert!(cancel.is_cancelled());
        assert!(matches!(
            mux.subscribe(&turn),
            Err(SubscribeError::UnknownTurn(_))
        ));
    }

    #[tokio::test]
    async fn finished_subscription_does_not_cancel() {
        let mux = StreamMultiplexer::new();
        let (turn, tx, cancel) = open_turn(&mux);
        let mut sub = mux.subscribe(&turn).unwrap();
        tx.send(done()).await.unwrap();
        assert_eq!(sub.recv().await, Some(done()));
        drop(sub);
        assert!(!cancel.is_cancelled());
        assert_eq!(mux.open_turns(), 0);
    }

    #[tokio::test]
    async fn turns_are_independent() {
        let mux = StreamMultiplexer::new();
        let (t1, tx1, _c1) = open_turn(&mux);
        let (t2, tx2, c2) = open_turn(&mux);
        let mut s1 = mux.subscribe(&t1).unwrap();
        let mut s2 = mux.subscribe(&t2).unwrap();

        mux.cancel(&t1).unwrap();
        tx2.send(token("x")).await.unwrap();
        tx2.send(done()).await.unwrap();

        assert_eq!(s1.recv().await, Some(StreamEvent::Cancelled));
        assert_eq!(s2.recv().await, Some(token("x")));
        assert_eq!(s2.recv().await, Some(done()));
        assert!(!c2.is_cancelled());
        drop(tx1);
    }
}
