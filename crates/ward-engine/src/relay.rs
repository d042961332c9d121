//! Per-execution event fan-out backed by `tokio::sync::broadcast`.
//!
//! Each live execution gets its own channel, opened before its first event
//! and closed after its terminal event. Subscribers see events from the
//! moment they subscribe; earlier events are not replayed. A global channel
//! carries every event from every execution.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError};

use crate::model::{ExecutionId, ProgressEvent};

/// Default per-channel buffer.
pub const DEFAULT_RELAY_CAPACITY: usize = 256;

/// Event fan-out hub.
#[derive(Debug)]
pub struct Relay {
    capacity: usize,
    channels: Mutex<HashMap<ExecutionId, broadcast::Sender<ProgressEvent>>>,
    all: broadcast::Sender<ProgressEvent>,
}

impl Relay {
    /// A relay whose channels buffer `capacity` events per subscriber.
    ///
    /// A subscriber that falls further behind loses the oldest events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
            all,
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ExecutionId, broadcast::Sender<ProgressEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the channel for an execution. Opening twice is a no-op.
    pub fn open(&self, execution_id: ExecutionId) {
        self.channels()
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Publish to the execution's subscribers and to global subscribers.
    ///
    /// Never blocks and never fails; events with no listener are dropped.
    pub fn publish(&self, event: ProgressEvent) {
        let channels = self.channels();
        if let Some(tx) = channels.get(&event.execution_id) {
            let _ = tx.send(event.clone());
        }
        // sent under the lock so both channels see one order per execution
        let _ = self.all.send(event);
    }

    /// Close an execution's channel. Subscribers drain what is buffered and
    /// then see the end of the stream.
    pub fn close(&self, execution_id: ExecutionId) {
        self.channels().remove(&execution_id);
    }

    /// Whether the execution's channel is open.
    pub fn is_open(&self, execution_id: ExecutionId) -> bool {
        self.channels().contains_key(&execution_id)
    }

    /// Number of open channels.
    pub fn open_channels(&self) -> usize {
        self.channels().len()
    }

    /// Subscribe to one execution. `None` if its channel is not open.
    pub fn subscribe(&self, execution_id: ExecutionId) -> Option<Subscription> {
        let rx = self.channels().get(&execution_id)?.subscribe();
        Some(Subscription {
            rx: Some(rx),
            ends_on_terminal: true,
            done: false,
        })
    }

    /// Subscribe to every execution. The stream never ends on its own.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: Some(self.all.subscribe()),
            ends_on_terminal: false,
            done: false,
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY)
    }
}

/// A stream of events.
#[derive(Debug)]
pub struct Subscription {
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    ends_on_terminal: bool,
    done: bool,
}

impl Subscription {
    /// An already-ended stream, for executions that have finished.
    pub fn finished() -> Self {
        Self {
            rx: None,
            ends_on_terminal: true,
            done: true,
        }
    }

    /// Next event. For a single execution, `None` follows the terminal
    /// status event. Events lost to lag are skipped with a warning.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if self.ends_on_terminal && event.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Whether the stream has ended.
    pub fn is_finished(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionStatus, StreamKind};
    use crate::OutputChunk;
    use chrono::Utc;

    fn output(id: ExecutionId, seq: u64, text: &str) -> ProgressEvent {
        ProgressEvent::output(
            id,
            OutputChunk {
                stream: StreamKind::Stdout,
                seq,
                text: text.into(),
                timestamp: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn subscriber_sees_events_until_terminal() {
        let relay = Relay::default();
        let id = ExecutionId::new();
        relay.open(id);
        let mut sub = relay.subscribe(id).unwrap();

        relay.publish(ProgressEvent::status(id, ExecutionStatus::Running, None));
        relay.publish(output(id, 0, "hello"));
        relay.publish(ProgressEvent::status(id, ExecutionStatus::Completed, None));
        relay.publish(output(id, 1, "after terminal"));

        assert!(matches!(
            sub.next().await.unwrap().payload,
            crate::EventPayload::Status { status: ExecutionStatus::Running, .. }
        ));
        assert!(matches!(sub.next().await.unwrap().payload, crate::EventPayload::Output { .. }));
        assert!(sub.next().await.unwrap().is_terminal());
        assert!(sub.next().await.is_none());
        assert!(sub.is_finished());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let relay = Relay::default();
        let id = ExecutionId::new();
        relay.open(id);
        relay.publish(output(id, 0, "early"));

        let mut sub = relay.subscribe(id).unwrap();
        relay.publish(output(id, 1, "late"));
        relay.close(id);

        let event = sub.next().await.unwrap();
        match event.payload {
            crate::EventPayload::Output { chunk } => assert_eq!(chunk.text, "late"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn executions_are_isolated() {
        let relay = Relay::default();
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        relay.open(a);
        relay.open(b);
        let mut sub_a = relay.subscribe(a).unwrap();

        relay.publish(output(b, 0, "for b"));
        relay.publish(output(a, 0, "for a"));
        relay.close(a);

        match sub_a.next().await.unwrap().payload {
            crate::EventPayload::Output { chunk } => assert_eq!(chunk.text, "for a"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(sub_a.next().await.is_none());
    }

    #[tokio::test]
    async fn global_subscriber_sees_everything() {
        let relay = Relay::default();
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        relay.open(a);
        let mut all = relay.subscribe_all();

        relay.publish(ProgressEvent::status(a, ExecutionStatus::Completed, None));
        relay.publish(output(b, 0, "unopened channel still reaches global"));

        assert_eq!(all.next().await.unwrap().execution_id, a);
        assert_eq!(all.next().await.unwrap().execution_id, b);
        assert!(!all.is_finished());
    }

    #[test]
    fn subscribe_to_unknown_channel_is_none() {
        let relay = Relay::default();
        assert!(relay.subscribe(ExecutionId::new()).is_none());
    }

    #[test]
    fn open_close_bookkeeping() {
        let relay = Relay::new(4);
        let id = ExecutionId::new();
        relay.open(id);
        relay.open(id);
        assert!(relay.is_open(id));
        assert_eq!(relay.open_channels(), 1);
        relay.close(id);
        assert!(!relay.is_open(id));
        assert_eq!(relay.open_channels(), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let relay = Relay::new(1);
        let id = ExecutionId::new();
        relay.open(id);
        for seq in 0..10 {
            relay.publish(output(id, seq, "nobody listening"));
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let relay = Relay::new(2);
        let id = ExecutionId::new();
        relay.open(id);
        let mut sub = relay.subscribe(id).unwrap();
        for seq in 0..5 {
            relay.publish(output(id, seq, "x"));
        }
        relay.close(id);

        let mut seqs = Vec::new();
        while let Some(event) = sub.next().await {
            if let crate::EventPayload::Output { chunk } = event.payload {
                seqs.push(chunk.seq);
            }
        }
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn finished_subscription_is_empty() {
        let mut sub = Subscription::finished();
        assert!(sub.next().await.is_none());
    }
}
