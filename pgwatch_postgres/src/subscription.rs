use std::fmt::{Debug, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pgwatch_listener::{ConnectionError, RawPayload, Subscription, SubscriptionSource};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::{debug, warn};

/// Opens `LISTEN` connections taken from a caller-owned pool.
#[derive(Debug, Clone)]
pub struct PgSubscriptionSource {
    pool: PgPool,
}

impl PgSubscriptionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SubscriptionSource for PgSubscriptionSource {
    async fn connect(&self) -> Result<Box<dyn Subscription>, ConnectionError> {
        let listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        debug!("opened postgres listener connection");
        Ok(Box::new(PgSubscription { listener }))
    }
}

struct PgSubscription {
    listener: PgListener,
}

impl Debug for PgSubscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSubscription").finish_non_exhaustive()
    }
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), ConnectionError> {
        self.listener
            .listen(channel)
            .await
            .map_err(|e| ConnectionError::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), ConnectionError> {
        self.listener
            .unlisten(channel)
            .await
            .map_err(|e| ConnectionError::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn read_next(&mut self, timeout: Duration) -> Result<Option<RawPayload>, ConnectionError> {
        // `try_recv` reports a dropped connection as `None` and would silently reconnect on the
        // next call, losing every notification sent in between.
        match tokio::time::timeout(timeout, self.listener.try_recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(Some(notification))) => Ok(Some(RawPayload::new(
                notification.channel(),
                Bytes::copy_from_slice(notification.payload().as_bytes()),
            ))),
            Ok(Ok(None)) => Err(ConnectionError::Lost(
                "postgres closed the listener connection".to_string(),
            )),
            Ok(Err(e)) => Err(ConnectionError::Lost(e.to_string())),
        }
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.listener.unlisten_all().await {
            warn!(%e, "failed to unlisten before closing the connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{maybe_skip_integration, test_pool, unique_name};
    use pretty_assertions::assert_eq;

    #[test_log::test(tokio::test)]
    async fn receives_notifications_for_subscribed_channels() {
        maybe_skip_integration!();
        let pool = test_pool().await;
        let source = PgSubscriptionSource::new(pool.clone());
        let channel = unique_name("pgwatch_sub");
        let other = unique_name("pgwatch_other");

        let mut sub = source.connect().await.unwrap();
        sub.subscribe(&channel).await.unwrap();

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&other)
            .bind("ignored")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(r#"{"id": 1}"#)
            .execute(&pool)
            .await
            .unwrap();

        let raw = sub
            .read_next(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("notification within timeout");
        assert_eq!(raw.channel.as_ref(), channel.as_str());
        assert_eq!(raw.body, Bytes::from_static(br#"{"id": 1}"#));

        sub.unsubscribe(&channel).await.unwrap();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind("late")
            .execute(&pool)
            .await
            .unwrap();
        assert!(
            sub.read_next(Duration::from_millis(200))
                .await
                .unwrap()
                .is_none()
        );

        sub.close().await;
    }
}
