use pgwatch_clap_blocks::PostgresArgs;
use pgwatch_postgres::{PgConnectionOptions, connect_pool};
use sqlx::PgPool;
use thiserror::Error;

use crate::APP_NAME;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("invalid postgres configuration: {0}")]
    Config(#[from] pgwatch_clap_blocks::postgres::Error),

    #[error("failed to connect to postgres: {0}")]
    Connect(#[from] sqlx::Error),
}

pub(crate) async fn connect(args: &PostgresArgs) -> Result<PgPool, Error> {
    let options: PgConnectionOptions = args.connection_options(APP_NAME)?;
    Ok(connect_pool(&options).await?)
}
