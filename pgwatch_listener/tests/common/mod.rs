#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use pgwatch_listener::{
    BackoffConfig, Consumer, ConsumerRegistry, InMemoryBus, ListenerConfig, ListenerHandle,
    ListenerLoop, ListenerState, Notification, Origin, SequenceId,
};
use serde_json::Value;
use tokio::sync::Notify;

/// Keeps every notification it handles
#[derive(Debug, Default)]
pub(crate) struct RecordingConsumer {
    seen: Mutex<Vec<Notification>>,
    notify: Notify,
}

impl RecordingConsumer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn seen(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    /// Wait until at least `count` notifications were handled
    pub(crate) async fn wait_for(&self, count: usize) -> Vec<Notification> {
        let waited = tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let notified = self.notify.notified();
                {
                    let seen = self.seen.lock();
                    if seen.len() >= count {
                        return seen.clone();
                    }
                }
                notified.await;
            }
        })
        .await;
        match waited {
            Ok(seen) => seen,
            Err(_) => panic!(
                "timed out waiting for {count} notifications, got {:?}",
                self.seen()
            ),
        }
    }
}

#[async_trait]
impl Consumer for RecordingConsumer {
    async fn handle(&self, notification: &Notification) -> anyhow::Result<()> {
        self.seen.lock().push(notification.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Fails on every notification
#[derive(Debug, Default)]
pub(crate) struct FailingConsumer;

#[async_trait]
impl Consumer for FailingConsumer {
    async fn handle(&self, notification: &Notification) -> anyhow::Result<()> {
        bail!("refusing {notification}")
    }
}

/// Panics on every notification
#[derive(Debug, Default)]
pub(crate) struct PanickingConsumer;

#[async_trait]
impl Consumer for PanickingConsumer {
    async fn handle(&self, _notification: &Notification) -> anyhow::Result<()> {
        panic!("consumer bug")
    }
}

pub(crate) fn config() -> ListenerConfig {
    ListenerConfig {
        read_timeout: Duration::from_secs(1),
        backoff: BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        },
        replay_max_attempts: 3,
        ..Default::default()
    }
}

pub(crate) fn listener(
    bus: &InMemoryBus,
    config: ListenerConfig,
    registry: ConsumerRegistry,
) -> ListenerLoop {
    ListenerLoop::new(
        config,
        Arc::new(bus.clone()),
        Arc::new(bus.clone()),
        registry,
    )
    .unwrap()
}

/// Spawn a listener and wait until it reads from the bus
pub(crate) async fn start(
    bus: &InMemoryBus,
    config: ListenerConfig,
    registry: ConsumerRegistry,
) -> ListenerHandle {
    let handle = listener(bus, config, registry).spawn();
    assert!(handle.wait_for_state(ListenerState::Reading).await);
    handle
}

pub(crate) fn registry_with(consumers: &[(&str, &str, Arc<dyn Consumer>)]) -> ConsumerRegistry {
    let mut registry = ConsumerRegistry::new();
    for (name, pattern, consumer) in consumers {
        registry
            .register_consumer(name, pattern, Arc::clone(consumer))
            .unwrap();
    }
    registry
}

pub(crate) fn emit(bus: &InMemoryBus, channel: &str, value: Value) -> SequenceId {
    let payload = value.as_object().cloned().unwrap_or_default();
    bus.emit_payload(channel, &payload).unwrap()
}

pub(crate) fn sequence_ids(notifications: &[Notification]) -> Vec<u64> {
    notifications
        .iter()
        .map(|n| n.sequence_id().unwrap().as_u64())
        .collect()
}

pub(crate) fn origins(notifications: &[Notification]) -> Vec<Origin> {
    notifications.iter().map(|n| n.origin()).collect()
}

/// Wait until the listener has read `count` payloads from its connection
pub(crate) async fn wait_for_received(handle: &ListenerHandle, count: u64) {
    for _ in 0..10_000 {
        if handle.metrics().received >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!(
        "listener received {} payloads, expected {count}",
        handle.metrics().received
    );
}
