//! Postgres connection configuration.

use std::time::Duration;

use pgwatch_postgres::{DEFAULT_OUTBOX_TABLE, PgConnectionOptions, validate_table_name};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(
        "Postgres DSN not specified. Expected a string like 'postgresql://postgres@localhost:5432/postgres'"
    )]
    DsnNotSpecified,

    #[error("Unknown Postgres DSN {dsn}. Expected a string starting with 'postgres://' or 'postgresql://'")]
    UnknownDsn { dsn: String },

    #[error(transparent)]
    OutboxTable(#[from] pgwatch_postgres::Error),
}

fn default_max_connections() -> &'static str {
    let s = PgConnectionOptions::DEFAULT_MAX_CONNS.to_string();
    Box::leak(Box::new(s))
}

fn default_connect_timeout() -> &'static str {
    let s = humantime::format_duration(PgConnectionOptions::DEFAULT_CONNECT_TIMEOUT).to_string();
    Box::leak(Box::new(s))
}

fn default_idle_timeout() -> &'static str {
    let s = humantime::format_duration(PgConnectionOptions::DEFAULT_IDLE_TIMEOUT).to_string();
    Box::leak(Box::new(s))
}

/// CLI config for the Postgres connection.
#[derive(Debug, Clone, clap::Parser)]
pub struct PostgresArgs {
    /// Postgres connection string, e.g. `postgresql://postgres@localhost:5432/postgres`.
    #[clap(long = "dsn", env = "PGWATCH_DSN", action)]
    pub dsn: Option<String>,

    /// Maximum number of connections to Postgres at any one time, including the one held by the
    /// listener.
    #[clap(
        long = "pg-max-connections",
        env = "PGWATCH_PG_MAX_CONNECTIONS",
        default_value = default_max_connections(),
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    pub max_connections: u32,

    /// Set the amount of time to attempt connecting to the database.
    #[clap(
        long = "pg-connect-timeout",
        env = "PGWATCH_PG_CONNECT_TIMEOUT",
        default_value = default_connect_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    #[clap(
        long = "pg-idle-timeout",
        env = "PGWATCH_PG_IDLE_TIMEOUT",
        default_value = default_idle_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub idle_timeout: Duration,

    /// Table that records emitted notifications for replay.
    #[clap(
        long = "outbox-table",
        env = "PGWATCH_OUTBOX_TABLE",
        default_value = DEFAULT_OUTBOX_TABLE,
        action
    )]
    pub outbox_table: String,
}

impl PostgresArgs {
    /// Connection options reporting `app_name` to Postgres.
    pub fn connection_options(&self, app_name: &str) -> Result<PgConnectionOptions, Error> {
        let Some(dsn) = self.dsn.as_ref() else {
            return Err(Error::DsnNotSpecified);
        };
        if !(dsn.starts_with("postgres://") || dsn.starts_with("postgresql://")) {
            return Err(Error::UnknownDsn {
                // do not echo credentials
                dsn: dsn.split('@').next_back().unwrap_or_default().to_string(),
            });
        }

        // do not log entire postgres dsn as it may contain credentials
        info!(outbox_table=%self.outbox_table, max_connections=self.max_connections, "Postgres");
        Ok(PgConnectionOptions {
            app_name: app_name.to_string(),
            dsn: dsn.clone(),
            max_conns: self.max_connections,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
        })
    }

    /// The outbox table name, checked to be safe to use in a statement.
    pub fn outbox_table(&self) -> Result<&str, Error> {
        validate_table_name(&self.outbox_table)?;
        Ok(&self.outbox_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn connection_options() {
        let args = PostgresArgs::try_parse_from([
            "pgwatch",
            "--dsn",
            "postgresql://app@localhost:5432/shop",
            "--pg-max-connections",
            "4",
            "--pg-idle-timeout",
            "1m",
        ])
        .unwrap();
        let options = args.connection_options("shop-listener").unwrap();

        assert_eq!(options.app_name, "shop-listener");
        assert_eq!(options.dsn, "postgresql://app@localhost:5432/shop");
        assert_eq!(options.max_conns, 4);
        assert_eq!(
            options.connect_timeout,
            PgConnectionOptions::DEFAULT_CONNECT_TIMEOUT
        );
        assert_eq!(options.idle_timeout, Duration::from_secs(60));
        assert_eq!(args.outbox_table().unwrap(), DEFAULT_OUTBOX_TABLE);
    }

    #[test]
    fn dsn_errors() {
        let args = PostgresArgs {
            dsn: None,
            max_connections: 1,
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            outbox_table: DEFAULT_OUTBOX_TABLE.to_string(),
        };
        assert!(matches!(
            args.connection_options("x"),
            Err(Error::DsnNotSpecified)
        ));

        let args = PostgresArgs {
            dsn: Some("mysql://root:secret@db/shop".to_string()),
            ..args
        };
        match args.connection_options("x") {
            Err(Error::UnknownDsn { dsn }) => assert_eq!(dsn, "db/shop"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn outbox_table_is_validated() {
        let args = PostgresArgs::try_parse_from([
            "pgwatch",
            "--outbox-table",
            "events; DROP TABLE users",
        ])
        .unwrap();
        assert!(matches!(args.outbox_table(), Err(Error::OutboxTable(_))));
    }
}
