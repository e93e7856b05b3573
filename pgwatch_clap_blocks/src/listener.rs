//! Listener loop configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwatch_listener::backoff::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
use pgwatch_listener::batcher::DEFAULT_MAX_BATCH_SIZE;
use pgwatch_listener::decoder::DEFAULT_MAX_PAYLOAD_SIZE;
use pgwatch_listener::listener::DEFAULT_READ_TIMEOUT;
use pgwatch_listener::replay::DEFAULT_REPLAY_MAX_ATTEMPTS;
use pgwatch_listener::{
    BackoffConfig, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, ListenerConfig,
};
use tracing::info;

fn leak_duration(d: Duration) -> &'static str {
    let s = humantime::format_duration(d).to_string();
    Box::leak(Box::new(s))
}

fn leak_number(n: impl ToString) -> &'static str {
    Box::leak(Box::new(n.to_string()))
}

/// CLI config for the listener loop.
#[derive(Debug, Clone, clap::Parser)]
pub struct ListenerArgs {
    /// Channels to LISTEN on in addition to those the active consumers name.
    #[clap(
        long = "channels",
        env = "PGWATCH_CHANNELS",
        value_delimiter = ',',
        action
    )]
    pub channels: Vec<String>,

    /// Largest number of notifications dispatched together.
    #[clap(
        long = "batch-size",
        env = "PGWATCH_BATCH_SIZE",
        default_value = leak_number(DEFAULT_MAX_BATCH_SIZE),
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub batch_size: u64,

    /// Longest a notification waits in an open batch.
    ///
    /// Defaults to the read timeout.
    #[clap(
        long = "batch-age",
        env = "PGWATCH_BATCH_AGE",
        value_parser = humantime::parse_duration,
    )]
    pub batch_age: Option<Duration>,

    /// How long a single read waits for a notification before the loop checks for shutdown and
    /// expired batches.
    #[clap(
        long = "read-timeout",
        env = "PGWATCH_READ_TIMEOUT",
        default_value = leak_duration(DEFAULT_READ_TIMEOUT),
        value_parser = humantime::parse_duration,
    )]
    pub read_timeout: Duration,

    /// First reconnect delay. Later delays double up to `--backoff-max`.
    #[clap(
        long = "backoff-base",
        env = "PGWATCH_BACKOFF_BASE",
        default_value = leak_duration(DEFAULT_BACKOFF_BASE),
        value_parser = humantime::parse_duration,
    )]
    pub backoff_base: Duration,

    /// Longest reconnect delay.
    #[clap(
        long = "backoff-max",
        env = "PGWATCH_BACKOFF_MAX",
        default_value = leak_duration(DEFAULT_BACKOFF_MAX),
        value_parser = humantime::parse_duration,
    )]
    pub backoff_max: Duration,

    /// Attempts per replay query before the missed notifications are given up.
    #[clap(
        long = "replay-max-attempts",
        env = "PGWATCH_REPLAY_MAX_ATTEMPTS",
        default_value = leak_number(DEFAULT_REPLAY_MAX_ATTEMPTS),
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    pub replay_max_attempts: u32,

    /// Largest accepted notification body, in bytes.
    #[clap(
        long = "max-payload-size",
        env = "PGWATCH_MAX_PAYLOAD_SIZE",
        default_value = leak_number(DEFAULT_MAX_PAYLOAD_SIZE),
        action
    )]
    pub max_payload_size: usize,

    /// Names of the consumers to activate. Activates every registered consumer when empty.
    #[clap(
        long = "consumers",
        env = "PGWATCH_CONSUMERS",
        value_delimiter = ',',
        action
    )]
    pub consumers: Vec<String>,

    /// File that keeps the last processed sequence id per channel across restarts.
    ///
    /// Without it, progress is only kept in memory.
    #[clap(long = "checkpoint-file", env = "PGWATCH_CHECKPOINT_FILE", action)]
    pub checkpoint_file: Option<PathBuf>,
}

impl ListenerArgs {
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            channels: non_empty(&self.channels),
            max_batch_size: usize::try_from(self.batch_size).unwrap_or(usize::MAX),
            max_batch_age: self.batch_age,
            read_timeout: self.read_timeout,
            backoff: BackoffConfig {
                base: self.backoff_base,
                max: self.backoff_max.max(self.backoff_base),
            },
            replay_max_attempts: self.replay_max_attempts,
            max_payload_size: self.max_payload_size,
            consumers: non_empty(&self.consumers),
        }
    }

    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        match &self.checkpoint_file {
            Some(path) => {
                info!(path=%path.display(), "Checkpoints: file");
                Arc::new(FileCheckpointStore::new(path.clone()))
            }
            None => {
                info!("Checkpoints: in-memory");
                Arc::new(InMemoryCheckpointStore::default())
            }
        }
    }
}

/// `--channels ""` and trailing commas produce empty entries
fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .collect()
}
