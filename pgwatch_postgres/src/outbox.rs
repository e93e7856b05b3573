//! The outbox table.
//!
//! Every emitted notification is stored as a row keyed by `(channel, id)`, where `id` counts up
//! from 1 per channel without holes. The row is inserted and `pg_notify` is called in the same
//! transaction, so a notification is delivered live if and only if it can be replayed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgwatch_id::SequenceId;
use pgwatch_listener::{
    Emitter, Payload, PublishError, RawPayload, ReplayStore, ReplayStoreError, encode_envelope,
};
use sqlx::{Executor, PgPool};
use tracing::{debug, info, warn};

use crate::{Result, validate_table_name};

pub const DEFAULT_OUTBOX_TABLE: &str = "pgwatch_notification_log";

/// Create the outbox table `table` if it does not exist yet.
pub async fn ensure_outbox_table(pool: &PgPool, table: &str) -> Result<()> {
    validate_table_name(table)?;
    pool.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                channel     TEXT        NOT NULL,
                id          BIGINT      NOT NULL,
                payload     JSONB       NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (channel, id)
            );"
        )
        .as_str(),
    )
    .await?;
    info!(%table, "outbox table ready");
    Ok(())
}

fn to_sequence_id(id: i64) -> SequenceId {
    SequenceId::new(u64::try_from(id).unwrap_or_default())
}

fn to_row_id(id: SequenceId) -> i64 {
    i64::try_from(id.as_u64()).unwrap_or(i64::MAX)
}

/// Reads notifications back out of the outbox table.
#[derive(Debug, Clone)]
pub struct PgOutboxReplayStore {
    pool: PgPool,
    select: String,
}

impl PgOutboxReplayStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let select = format!(
            "SELECT id, created_at, payload::text
             FROM {table}
             WHERE channel = $1 AND id > $2
             ORDER BY id;"
        );
        Ok(Self { pool, select })
    }
}

#[async_trait]
impl ReplayStore for PgOutboxReplayStore {
    async fn fetch_since(
        &self,
        channel: &str,
        after: SequenceId,
    ) -> Result<Vec<RawPayload>, ReplayStoreError> {
        let rows: Vec<(i64, DateTime<Utc>, String)> = sqlx::query_as(&self.select)
            .bind(channel)
            .bind(to_row_id(after))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ReplayStoreError {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;

        debug!(%channel, %after, rows = rows.len(), "fetched outbox rows");
        Ok(rows
            .into_iter()
            .map(|(id, created_at, payload)| {
                let body = match replayed_body(id, created_at, &payload) {
                    Ok(body) => body,
                    Err(e) => {
                        // the decoder reports it as malformed
                        warn!(%channel, id, error = %e, "outbox row does not hold a JSON object");
                        payload
                    }
                };
                RawPayload::new(channel, body)
            })
            .collect())
    }
}

/// Rebuild the envelope the live notification for an outbox row carried.
///
/// Postgres renders `jsonb` with a space after every `:` and `,`, so its text form can be
/// noticeably larger than the compact body that went through `pg_notify`.
fn replayed_body(
    id: i64,
    created_at: DateTime<Utc>,
    payload: &str,
) -> Result<String, serde_json::Error> {
    let payload: Payload = serde_json::from_str(payload)?;
    encode_envelope(Some(to_sequence_id(id)), Some(created_at), &payload)
}

/// Sends notifications with `pg_notify`, optionally recording them in an outbox table first.
#[derive(Debug, Clone)]
pub struct PgEmitter {
    pool: PgPool,
    insert: Option<String>,
}

impl PgEmitter {
    /// Notify without an outbox. Notifications carry no sequence id and cannot be replayed.
    pub fn new(pool: PgPool) -> Self {
        Self { pool, insert: None }
    }

    /// Record every notification in `table` before notifying.
    pub fn with_outbox(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let insert = format!(
            "INSERT INTO {table} (channel, id, payload)
             SELECT $1, COALESCE(MAX(id), 0) + 1, $2::jsonb
             FROM {table}
             WHERE channel = $1
             RETURNING id, created_at;"
        );
        Ok(Self {
            pool,
            insert: Some(insert),
        })
    }

    async fn emit_with_outbox(
        &self,
        insert: &str,
        channel: &str,
        payload: &Payload,
    ) -> Result<SequenceId, PublishError> {
        let data = serde_json::to_string(payload)?;
        let mut tx = self.pool.begin().await.map_err(emit_error)?;

        // Serialise writers per channel so ids stay contiguous.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1));")
            .bind(channel)
            .execute(&mut *tx)
            .await
            .map_err(emit_error)?;

        let (id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(insert)
            .bind(channel)
            .bind(data)
            .fetch_one(&mut *tx)
            .await
            .map_err(emit_error)?;
        let id = to_sequence_id(id);

        let body = encode_envelope(Some(id), Some(created_at), payload)?;
        notify(&mut *tx, channel, &body).await?;
        tx.commit().await.map_err(emit_error)?;

        debug!(%channel, %id, "emitted notification");
        Ok(id)
    }
}

#[async_trait]
impl Emitter for PgEmitter {
    async fn emit(
        &self,
        channel: &str,
        payload: &Payload,
    ) -> Result<Option<SequenceId>, PublishError> {
        match &self.insert {
            Some(insert) => Ok(Some(self.emit_with_outbox(insert, channel, payload).await?)),
            None => {
                let body = encode_envelope(None, Some(Utc::now()), payload)?;
                notify(&self.pool, channel, &body).await?;
                Ok(None)
            }
        }
    }
}

async fn notify<'c, E>(executor: E, channel: &str, body: &str) -> Result<(), PublishError>
where
    E: Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("SELECT pg_notify($1, $2);")
        .bind(channel)
        .bind(body)
        .execute(executor)
        .await
        .map_err(emit_error)?;
    Ok(())
}

fn emit_error(e: sqlx::Error) -> PublishError {
    PublishError::Emit(e.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::PgSubscriptionSource;
    use crate::test_utils::{maybe_skip_integration, test_pool, unique_name};
    use pgwatch_listener::decoder::DEFAULT_MAX_PAYLOAD_SIZE;
    use pgwatch_listener::{Decoder, Origin, Publisher, SubscriptionSource};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn row_id_conversion_saturates() {
        assert_eq!(to_row_id(SequenceId::new(7)), 7);
        assert_eq!(to_row_id(SequenceId::new(u64::MAX)), i64::MAX);
        assert_eq!(to_sequence_id(-1), SequenceId::new(0));
        assert_eq!(to_sequence_id(42), SequenceId::new(42));
    }

    /// Postgres' text rendering of a `jsonb` object.
    fn jsonb_text(payload: &Payload) -> String {
        let fields: Vec<_> = payload
            .iter()
            .map(|(k, v)| format!("{}: {v}", serde_json::Value::String(k.clone())))
            .collect();
        format!("{{{}}}", fields.join(", "))
    }

    #[test]
    fn near_limit_rows_replay_at_their_live_size() {
        let payload: Payload = (0..700)
            .map(|i| (format!("k{i:03}"), json!(i)))
            .collect();
        let created_at = Utc::now();
        let live = encode_envelope(Some(SequenceId::new(9)), Some(created_at), &payload).unwrap();
        assert!(live.len() < 8000, "live body is {} bytes", live.len());

        let stored = jsonb_text(&payload);
        assert!(stored.len() > DEFAULT_MAX_PAYLOAD_SIZE);

        let body = replayed_body(9, created_at, &stored).unwrap();
        assert_eq!(body.len(), live.len());

        let n = Decoder::default()
            .decode_replayed(&RawPayload::new("orders", body))
            .unwrap();
        assert_eq!(n.sequence_id(), Some(SequenceId::new(9)));
        assert_eq!(n.origin(), Origin::Replayed);
        assert_eq!(n.payload(), &payload);
        assert_eq!(n.emitted_at(), Some(created_at));
    }

    #[test]
    fn non_object_rows_are_not_rebuilt() {
        assert!(replayed_body(1, Utc::now(), "[1, 2]").is_err());
        assert!(replayed_body(1, Utc::now(), "\"text\"").is_err());
    }

    #[tokio::test]
    async fn rejects_unsafe_table_names() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        assert!(PgOutboxReplayStore::new(pool.clone(), "x; DROP TABLE y").is_err());
        assert!(PgEmitter::with_outbox(pool, "a.b.c").is_err());
    }

    #[test_log::test(tokio::test)]
    async fn emitted_notifications_are_delivered_and_replayable() {
        maybe_skip_integration!();
        let pool = test_pool().await;
        let table = unique_name("pgwatch_outbox");
        let channel = unique_name("pgwatch_orders");
        ensure_outbox_table(&pool, &table).await.unwrap();
        // idempotent
        ensure_outbox_table(&pool, &table).await.unwrap();

        let mut sub = PgSubscriptionSource::new(pool.clone())
            .connect()
            .await
            .unwrap();
        sub.subscribe(&channel).await.unwrap();

        let publisher = Publisher::new(std::sync::Arc::new(
            PgEmitter::with_outbox(pool.clone(), &table).unwrap(),
        ));
        let first = publisher
            .publish_value(&channel, json!({"id": 1, "action": "INSERT"}))
            .await
            .unwrap();
        let second = publisher
            .publish_value(&channel, json!({"id": 2, "action": "UPDATE"}))
            .await
            .unwrap();
        assert_eq!(first, Some(SequenceId::new(1)));
        assert_eq!(second, Some(SequenceId::new(2)));

        let decoder = Decoder::default();
        let live = sub
            .read_next(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("live notification");
        let live = decoder.decode(&live).unwrap();
        assert_eq!(live.sequence_id(), first);
        assert_eq!(live.payload()["action"], json!("INSERT"));

        let store = PgOutboxReplayStore::new(pool.clone(), &table).unwrap();
        let replayed = store
            .fetch_since(&channel, SequenceId::new(1))
            .await
            .unwrap();
        assert_eq!(replayed.len(), 1);
        let replayed = decoder.decode_replayed(&replayed[0]).unwrap();
        assert_eq!(replayed.sequence_id(), second);
        assert_eq!(replayed.origin(), Origin::Replayed);
        assert_eq!(replayed.payload()["id"], json!(2));
        assert!(replayed.emitted_at().is_some());

        assert!(
            store
                .fetch_since(&channel, SequenceId::new(2))
                .await
                .unwrap()
                .is_empty()
        );

        sub.close().await;
        pool.execute(format!("DROP TABLE {table};").as_str())
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn notify_without_outbox_has_no_sequence_id() {
        maybe_skip_integration!();
        let pool = test_pool().await;
        let channel = unique_name("pgwatch_plain");

        let mut sub = PgSubscriptionSource::new(pool.clone())
            .connect()
            .await
            .unwrap();
        sub.subscribe(&channel).await.unwrap();

        let id = PgEmitter::new(pool.clone())
            .emit(&channel, json!({"k": "v"}).as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(id, None);

        let raw = sub
            .read_next(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("notification");
        let n = Decoder::default().decode(&raw).unwrap();
        assert_eq!(n.sequence_id(), None);
        assert_eq!(n.payload()["k"], json!("v"));

        sub.close().await;
    }
}
