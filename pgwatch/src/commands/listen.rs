use std::sync::Arc;

use pgwatch_clap_blocks::{ListenerArgs, PostgresArgs};
use pgwatch_listener::registry::WILDCARD;
use pgwatch_listener::{
    ConsumerRegistry, ListenerLoop, ListenerState, LoggingConsumer, RegistryError,
};
use pgwatch_postgres::{PgOutboxReplayStore, PgSubscriptionSource, ensure_outbox_table};
use pgwatch_shutdown::{ShutdownManager, wait_for_signal};
use thiserror::Error;
use tracing::{info, warn};

use super::common;

/// Name of the consumer that logs every notification
const LOG_CONSUMER: &str = "log";

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("no channels to listen on, pass --channels or set PGWATCH_CHANNELS")]
    NoChannels,

    #[error(transparent)]
    Common(#[from] common::Error),

    #[error(transparent)]
    Config(#[from] pgwatch_clap_blocks::postgres::Error),

    #[error(transparent)]
    Outbox(#[from] pgwatch_postgres::Error),

    #[error("invalid consumer selection: {0}")]
    Registry(#[from] RegistryError),

    #[error("listener failed: {0}")]
    Listener(#[from] pgwatch_listener::Error),
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) postgres: PostgresArgs,

    #[clap(flatten)]
    pub(crate) listener: ListenerArgs,

    /// Create the outbox table on start if it does not exist.
    #[clap(long = "create-outbox", env = "PGWATCH_CREATE_OUTBOX", action)]
    pub(crate) create_outbox: bool,
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let listener_config = config.listener.listener_config();
    if listener_config.channels.is_empty() {
        return Err(Error::NoChannels);
    }

    let outbox_table = config.postgres.outbox_table()?;
    let pool = common::connect(&config.postgres).await?;
    if config.create_outbox {
        ensure_outbox_table(&pool, outbox_table).await?;
    }

    let mut registry = ConsumerRegistry::new();
    registry.register_consumer(LOG_CONSUMER, WILDCARD, Arc::new(LoggingConsumer))?;

    let shutdown = ShutdownManager::new();
    let listener = ListenerLoop::new(
        listener_config,
        Arc::new(PgSubscriptionSource::new(pool.clone())),
        Arc::new(PgOutboxReplayStore::new(pool.clone(), outbox_table)?),
        registry,
    )?
    .with_checkpoint_store(config.listener.checkpoint_store())
    .with_shutdown_token(shutdown.register("listener"));
    let metrics = listener.metrics();
    let handle = listener.spawn();

    tokio::select! {
        _ = wait_for_signal() => {}
        _ = handle.wait_for_state(ListenerState::Stopped) => {
            warn!("listener stopped before shutdown was requested");
        }
    }
    shutdown.shutdown();
    let result = handle.join().await;
    shutdown.join().await;
    pool.close().await;

    let m = metrics.snapshot();
    info!(
        received = m.received,
        delivered = m.delivered,
        consumer_failures = m.consumer_failures,
        replayed = m.replayed,
        gaps = m.gaps,
        reconnects = m.reconnects,
        "listener stopped"
    );
    Ok(result?)
}
