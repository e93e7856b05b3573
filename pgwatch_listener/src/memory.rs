//! An in-process notification bus with an outbox.
//!
//! [`InMemoryBus`] is a [`SubscriptionSource`], a [`ReplayStore`] and an [`Emitter`] at once. It
//! numbers notifications per channel the way an outbox table does, and can be told to lose
//! connections, drop live deliveries or fail replay queries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use pgwatch_id::SequenceId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::encode_envelope;
use crate::notification::Payload;
use crate::publish::{Emitter, PublishError};
use crate::replay::{ReplayStore, ReplayStoreError};
use crate::subscription::{ConnectionError, RawPayload, Subscription, SubscriptionSource};

#[derive(Debug)]
enum BusMessage {
    Payload(RawPayload),
    Disconnect(String),
}

#[derive(Debug)]
struct Connection {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Debug, Default)]
struct BusState {
    outbox: HashMap<String, Vec<(SequenceId, Bytes)>>,
    connections: HashMap<u64, Connection>,
    next_connection_id: u64,
    suppress_live: HashMap<String, usize>,
    fail_replays: usize,
    fail_connects: usize,
    replay_queries: Vec<(String, SequenceId)>,
}

impl BusState {
    fn deliver(&mut self, raw: RawPayload) {
        self.connections.retain(|id, conn| {
            if !conn.channels.contains(raw.channel.as_ref()) {
                return true;
            }
            let delivered = conn.tx.send(BusMessage::Payload(raw.clone())).is_ok();
            if !delivered {
                debug!(connection = id, "dropping closed in-memory connection");
            }
            delivered
        });
    }

    fn take_suppression(&mut self, channel: &str) -> bool {
        match self.suppress_live.get_mut(channel) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` in the outbox and deliver it to every connection subscribed to `channel`.
    /// Returns the assigned sequence id.
    pub fn emit_payload(
        &self,
        channel: &str,
        payload: &Payload,
    ) -> Result<SequenceId, serde_json::Error> {
        let mut state = self.state.lock();
        let entries = state.outbox.entry(channel.to_string()).or_default();
        let id = SequenceId::new(entries.len() as u64 + 1);
        let body = Bytes::from(encode_envelope(Some(id), Some(Utc::now()), payload)?);
        entries.push((id, body.clone()));

        if state.take_suppression(channel) {
            debug!(%channel, %id, "suppressed live delivery");
        } else {
            state.deliver(RawPayload::new(channel, body));
        }
        Ok(id)
    }

    /// Deliver `body` as is to live connections, bypassing the outbox
    pub fn emit_raw(&self, channel: &str, body: impl Into<Bytes>) {
        self.state
            .lock()
            .deliver(RawPayload::new(channel, body.into()));
    }

    /// Break every open connection. Payloads already delivered are still read first.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        for (_, conn) in state.connections.drain() {
            let _ = conn
                .tx
                .send(BusMessage::Disconnect("in-memory connection dropped".to_string()));
        }
    }

    /// Store but do not deliver live the next `n` notifications emitted on `channel`
    pub fn suppress_next_live(&self, channel: &str, n: usize) {
        *self
            .state
            .lock()
            .suppress_live
            .entry(channel.to_string())
            .or_default() += n;
    }

    pub fn fail_next_replays(&self, n: usize) {
        self.state.lock().fail_replays += n;
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects += n;
    }

    /// Every `fetch_since` call so far, as `(channel, after)`
    pub fn replay_queries(&self) -> Vec<(String, SequenceId)> {
        self.state.lock().replay_queries.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Channels subscribed by any open connection
    pub fn subscribed_channels(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut channels: Vec<String> = state
            .connections
            .values()
            .flat_map(|c| c.channels.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        channels.sort();
        channels
    }

    pub fn outbox_len(&self, channel: &str) -> usize {
        self.state.lock().outbox.get(channel).map_or(0, Vec::len)
    }
}

#[async_trait]
impl SubscriptionSource for InMemoryBus {
    async fn connect(&self) -> Result<Box<dyn Subscription>, ConnectionError> {
        let mut state = self.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ConnectionError::Connect(
                "in-memory bus refused the connection".to_string(),
            ));
        }
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            Connection {
                channels: HashSet::new(),
                tx,
            },
        );
        Ok(Box::new(MemorySubscription {
            id,
            bus: self.clone(),
            rx,
        }))
    }
}

#[async_trait]
impl ReplayStore for InMemoryBus {
    async fn fetch_since(
        &self,
        channel: &str,
        after: SequenceId,
    ) -> Result<Vec<RawPayload>, ReplayStoreError> {
        let mut state = self.state.lock();
        state.replay_queries.push((channel.to_string(), after));
        if state.fail_replays > 0 {
            state.fail_replays -= 1;
            return Err(ReplayStoreError {
                channel: channel.to_string(),
                reason: "in-memory replay failure".to_string(),
            });
        }
        let channel_arc: Arc<str> = Arc::from(channel);
        Ok(state
            .outbox
            .get(channel)
            .into_iter()
            .flatten()
            .filter(|(id, _)| *id > after)
            .map(|(_, body)| RawPayload {
                channel: Arc::clone(&channel_arc),
                body: body.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl Emitter for InMemoryBus {
    async fn emit(
        &self,
        channel: &str,
        payload: &Payload,
    ) -> Result<Option<SequenceId>, PublishError> {
        Ok(Some(self.emit_payload(channel, payload)?))
    }
}

#[derive(Debug)]
struct MemorySubscription {
    id: u64,
    bus: InMemoryBus,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl MemorySubscription {
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> T,
    ) -> Result<T, ConnectionError> {
        let mut state = self.bus.state.lock();
        state
            .connections
            .get_mut(&self.id)
            .map(f)
            .ok_or_else(|| ConnectionError::Lost("in-memory connection is closed".to_string()))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), ConnectionError> {
        self.with_connection(|c| {
            c.channels.insert(channel.to_string());
        })
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), ConnectionError> {
        self.with_connection(|c| {
            c.channels.remove(channel);
        })
    }

    async fn read_next(&mut self, timeout: Duration) -> Result<Option<RawPayload>, ConnectionError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(BusMessage::Payload(raw))) => Ok(Some(raw)),
            Ok(Some(BusMessage::Disconnect(reason))) => Err(ConnectionError::Lost(reason)),
            Ok(None) => Err(ConnectionError::Lost(
                "in-memory connection is closed".to_string(),
            )),
        }
    }

    async fn close(self: Box<Self>) {
        self.bus.state.lock().connections.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_to_subscribed_connections_only() {
        let bus = InMemoryBus::new();
        let mut orders = bus.connect().await.unwrap();
        orders.subscribe("orders").await.unwrap();
        let mut users = bus.connect().await.unwrap();
        users.subscribe("users").await.unwrap();

        let id = bus
            .emit_payload("orders", &payload(json!({"id": 1})))
            .unwrap();
        assert_eq!(id, SequenceId::new(1));

        let raw = orders
            .read_next(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let n = Decoder::default().decode(&raw).unwrap();
        assert_eq!(n.sequence_id(), Some(id));
        assert!(users.read_next(Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(bus.subscribed_channels(), vec!["orders", "users"]);

        orders.close().await;
        users.close().await;
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn suppressed_notifications_are_only_replayed() {
        let bus = InMemoryBus::new();
        let mut sub = bus.connect().await.unwrap();
        sub.subscribe("orders").await.unwrap();

        bus.suppress_next_live("orders", 1);
        bus.emit_payload("orders", &Payload::new()).unwrap();
        bus.emit_payload("orders", &Payload::new()).unwrap();

        let raw = sub.read_next(Duration::from_secs(1)).await.unwrap().unwrap();
        let n = Decoder::default().decode(&raw).unwrap();
        assert_eq!(n.sequence_id(), Some(SequenceId::new(2)));

        let replayed = bus.fetch_since("orders", SequenceId::new(0)).await.unwrap();
        assert_eq!(replayed.len(), 2);
        let replayed = bus.fetch_since("orders", SequenceId::new(1)).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(bus.replay_queries().len(), 2);
        assert_eq!(bus.outbox_len("orders"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_faults() {
        let bus = InMemoryBus::new();
        bus.fail_next_connects(1);
        assert!(matches!(
            bus.connect().await,
            Err(ConnectionError::Connect(_))
        ));

        let mut sub = bus.connect().await.unwrap();
        sub.subscribe("orders").await.unwrap();
        bus.emit_raw("orders", "not json");
        bus.disconnect_all();

        let raw = sub.read_next(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(raw.body, Bytes::from_static(b"not json"));
        assert!(matches!(
            sub.read_next(Duration::from_secs(1)).await,
            Err(ConnectionError::Lost(_))
        ));
        assert!(matches!(
            sub.subscribe("users").await,
            Err(ConnectionError::Lost(_))
        ));

        bus.fail_next_replays(1);
        assert!(bus.fetch_since("orders", SequenceId::new(0)).await.is_err());
        assert!(bus.fetch_since("orders", SequenceId::new(0)).await.is_ok());
    }
}
