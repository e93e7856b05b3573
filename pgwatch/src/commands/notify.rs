use std::sync::Arc;

use pgwatch_clap_blocks::PostgresArgs;
use pgwatch_listener::{PublishError, Publisher};
use pgwatch_postgres::PgEmitter;
use thiserror::Error;

use super::common;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Common(#[from] common::Error),

    #[error(transparent)]
    Config(#[from] pgwatch_clap_blocks::postgres::Error),

    #[error(transparent)]
    Outbox(#[from] pgwatch_postgres::Error),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("failed to publish: {0}")]
    Publish(#[from] PublishError),
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) postgres: PostgresArgs,

    /// Send with `pg_notify` only. The notification gets no sequence id and cannot be replayed.
    #[clap(long = "no-outbox", action)]
    pub(crate) no_outbox: bool,

    /// Channel to notify
    #[clap(action)]
    pub(crate) channel: String,

    /// JSON object to send, `null` sends an empty payload
    #[clap(action)]
    pub(crate) payload: String,
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let value: serde_json::Value = serde_json::from_str(&config.payload)?;
    let pool = common::connect(&config.postgres).await?;

    let emitter = if config.no_outbox {
        PgEmitter::new(pool.clone())
    } else {
        PgEmitter::with_outbox(pool.clone(), config.postgres.outbox_table()?)?
    };
    let sequence_id = Publisher::new(Arc::new(emitter))
        .publish_value(&config.channel, value)
        .await?;
    pool.close().await;

    match sequence_id {
        Some(id) => println!("sent notification {id} on {}", config.channel),
        None => println!("sent notification on {}", config.channel),
    }
    Ok(())
}
