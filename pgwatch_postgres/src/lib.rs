//! Postgres adapters for the notification listener.
//!
//! * [`PgSubscriptionSource`] opens `LISTEN` connections from a caller-owned [`sqlx::PgPool`].
//! * [`PgOutboxReplayStore`] reads missed notifications back out of an outbox table.
//! * [`PgEmitter`] writes to the outbox and calls `pg_notify` in one transaction.

use thiserror::Error;

mod outbox;
mod pool;
mod subscription;

pub use outbox::{DEFAULT_OUTBOX_TABLE, PgEmitter, PgOutboxReplayStore, ensure_outbox_table};
pub use pool::{PgConnectionOptions, connect_pool};
pub use subscription::PgSubscriptionSource;

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("invalid table name {name:?}: {reason}")]
    InvalidTableName { name: String, reason: &'static str },

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Check that `name` is a plain, optionally schema-qualified, SQL identifier so it can be
/// interpolated into a statement.
pub fn validate_table_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidTableName {
            name: name.to_string(),
            reason,
        })
    };

    let mut parts = name.split('.');
    let (Some(first), second, None) = (parts.next(), parts.next(), parts.next()) else {
        return invalid("at most one schema qualifier is allowed");
    };

    for part in std::iter::once(first).chain(second) {
        let mut chars = part.chars();
        match chars.next() {
            None => return invalid("empty identifier"),
            Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
                return invalid("identifiers must start with a letter or underscore");
            }
            Some(_) => {}
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return invalid("identifiers may only contain letters, digits and underscores");
        }
        if part.len() > 63 {
            return invalid("identifiers are limited to 63 bytes");
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_utils {
    /// Skip the test unless `TEST_INTEGRATION` and the variables it needs are set.
    macro_rules! maybe_skip_integration {
        ($panic_msg:expr) => {{
            dotenvy::dotenv().ok();

            let required_vars = ["TEST_PGWATCH_DSN"];
            let unset_vars: Vec<_> = required_vars
                .iter()
                .filter_map(|&name| match std::env::var(name) {
                    Ok(_) => None,
                    Err(_) => Some(name),
                })
                .collect();
            let unset_var_names = unset_vars.join(", ");

            let force = std::env::var("TEST_INTEGRATION");

            if force.is_ok() && !unset_var_names.is_empty() {
                panic!(
                    "TEST_INTEGRATION is set, \
                            but variable(s) {unset_var_names} need to be set"
                );
            } else if force.is_err() {
                eprintln!(
                    "skipping Postgres integration test - set {}TEST_INTEGRATION to run",
                    if unset_var_names.is_empty() {
                        String::new()
                    } else {
                        format!("{unset_var_names} and ")
                    }
                );

                let panic_msg: &'static str = $panic_msg;
                if !panic_msg.is_empty() {
                    panic!("{}", panic_msg);
                }

                return;
            }
        }};
        () => {
            maybe_skip_integration!("")
        };
    }

    pub(crate) use maybe_skip_integration;

    use crate::{PgConnectionOptions, connect_pool};
    use rand::Rng;
    use rand::distributions::Alphanumeric;
    use sqlx::PgPool;

    pub(crate) async fn test_pool() -> PgPool {
        let dsn = std::env::var("TEST_PGWATCH_DSN").expect("TEST_PGWATCH_DSN set");
        let options = PgConnectionOptions {
            app_name: "pgwatch_test".to_string(),
            dsn,
            ..Default::default()
        };
        connect_pool(&options).await.expect("connect to test database")
    }

    /// A lowercase name unlikely to collide with concurrent test runs
    pub(crate) fn unique_name(prefix: &str) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        format!("{prefix}_{}", suffix.to_lowercase())
    }
}
