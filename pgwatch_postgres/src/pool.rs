use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Postgres connection options.
#[derive(Debug, Clone)]
pub struct PgConnectionOptions {
    /// Application name.
    ///
    /// This will be reported to postgres.
    pub app_name: String,

    /// DSN.
    pub dsn: String,

    /// Maximum number of concurrent connections.
    ///
    /// A [`PgSubscriptionSource`](crate::PgSubscriptionSource) holds one of them for as long as
    /// its subscription is open.
    pub max_conns: u32,

    /// How long to wait for a pooled connection before giving up.
    pub connect_timeout: Duration,

    /// Set the amount of time to idle before idling connections are closed.
    pub idle_timeout: Duration,
}

impl PgConnectionOptions {
    pub const DEFAULT_APP_NAME: &'static str = "pgwatch";
    pub const DEFAULT_MAX_CONNS: u32 = 10;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for PgConnectionOptions {
    fn default() -> Self {
        Self {
            app_name: Self::DEFAULT_APP_NAME.to_string(),
            dsn: String::new(),
            max_conns: Self::DEFAULT_MAX_CONNS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Create a connection pool configured from `options`.
///
/// Every new connection reports `app_name` unless the DSN already set an application name, and
/// runs in UTC.
pub async fn connect_pool(options: &PgConnectionOptions) -> Result<PgPool, sqlx::Error> {
    let app_name = options.app_name.clone();
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(options.max_conns)
        .acquire_timeout(options.connect_timeout)
        .idle_timeout(options.idle_timeout)
        .test_before_acquire(true)
        .after_connect(move |c, _meta| {
            let app_name = app_name.clone();
            Box::pin(async move {
                // a DSN may already set the application name
                let current: String =
                    sqlx::query_scalar("SELECT current_setting('application_name');")
                        .fetch_one(&mut *c)
                        .await?;
                if current.is_empty() {
                    sqlx::query("SELECT set_config('application_name', $1, false);")
                        .bind(&*app_name)
                        .execute(&mut *c)
                        .await?;
                }
                c.execute("SET timezone = 'UTC';").await?;
                Ok(())
            })
        })
        .connect(&options.dsn)
        .await?;

    info!(application_name=%options.app_name, "connected to postgres");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{maybe_skip_integration, test_pool};
    use sqlx::Row;

    #[test]
    fn defaults() {
        let options = PgConnectionOptions::default();
        assert_eq!(options.app_name, "pgwatch");
        assert_eq!(options.max_conns, 10);
        assert_eq!(options.connect_timeout, Duration::from_secs(2));
        assert_eq!(options.idle_timeout, Duration::from_secs(10));
        assert!(options.dsn.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn sets_application_name_and_timezone() {
        maybe_skip_integration!();
        let pool = test_pool().await;

        let row = sqlx::query(
            "SELECT current_setting('application_name') AS app, current_setting('TimeZone') AS tz;",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let app: String = row.get("app");
        let tz: String = row.get("tz");

        assert_eq!(app, "pgwatch_test");
        assert_eq!(tz, "UTC");
    }
}
