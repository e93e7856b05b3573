use pgwatch_clap_blocks::PostgresArgs;
use pgwatch_postgres::ensure_outbox_table;
use thiserror::Error;

use super::common;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Common(#[from] common::Error),

    #[error("failed to create the outbox table: {0}")]
    Outbox(#[from] pgwatch_postgres::Error),

    #[error(transparent)]
    Config(#[from] pgwatch_clap_blocks::postgres::Error),
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) postgres: PostgresArgs,
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let table = config.postgres.outbox_table()?;
    let pool = common::connect(&config.postgres).await?;
    ensure_outbox_table(&pool, table).await?;
    pool.close().await;
    println!("outbox table {table} is ready");
    Ok(())
}
