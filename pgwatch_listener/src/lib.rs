//! Delivers database change notifications to application consumers.
//!
//! A [`ListenerLoop`] holds one subscription connection, decodes each payload into a
//! [`Notification`], groups notifications into [`Batch`]es and hands every batch to a
//! [`Dispatcher`], which calls the [`Consumer`]s registered for each channel. Notifications missed
//! while disconnected, or skipped by the live connection, are recovered from a [`ReplayStore`].

pub mod backoff;
pub mod batcher;
pub mod checkpoint;
pub mod consumer;
pub mod decoder;
pub mod dispatcher;
mod envelope;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod notification;
pub mod publish;
pub mod registry;
pub mod replay;
pub mod subscription;

pub use backoff::BackoffConfig;
pub use batcher::{Batch, Batcher};
pub use checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
pub use consumer::{Consumer, LoggingConsumer};
pub use decoder::{DecodeError, Decoder};
pub use dispatcher::{ConsumerFailure, ContractViolation, DispatchReport, Dispatcher};
pub use envelope::encode_envelope;
pub use listener::{Error, ListenerConfig, ListenerHandle, ListenerLoop, ListenerState};
pub use memory::InMemoryBus;
pub use metrics::{ListenerMetrics, MetricsSnapshot};
pub use notification::{ChangeAction, Notification, Origin, Payload};
pub use publish::{Emitter, PublishError, Publisher};
pub use registry::{ChannelPattern, ConsumerRegistration, ConsumerRegistry, RegistryError};
pub use replay::{ReplayStore, ReplayStoreError};
pub use subscription::{ConnectionError, RawPayload, Subscription, SubscriptionSource};

pub use pgwatch_id::{ChannelSequences, SequenceId};
