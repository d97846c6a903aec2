//! Postgres store adapter.
//!
//! Stroke IDs are stored as their canonical 36-char text form; for UUIDv7
//! that makes `ORDER BY stroke_id` a time order, which the newest-first
//! page listing relies on.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;
use wv_protocol::{KeyEnvelope, Layer, Provider, Stroke, StrokeRecord};

use super::{DeleteOutcome, LayerSelector, Store, StoreError, User};

/// Per-call deadline on every store round trip.
const CALL_DEADLINE: Duration = Duration::from_secs(5);

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn with_deadline<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(CALL_DEADLINE, fut)
        .await
        .map_err(|_| StoreError::Timeout)?
}

fn layer_to_db(layer: Layer) -> i16 {
    i16::from(u8::from(layer))
}

fn layer_from_db(value: i16) -> Layer {
    if value == 1 { Layer::Private } else { Layer::Public }
}

fn row_to_user(row: &PgRow) -> User {
    let salt_kek: String = row.get("salt_kek");
    let envelope = if salt_kek.is_empty() {
        None
    } else {
        Some(KeyEnvelope {
            salt_kek,
            encrypted_dek1: row.get("encrypted_dek1"),
            nonce_dek1: row.get("nonce_dek1"),
            encrypted_dek2: row.get("encrypted_dek2"),
            nonce_dek2: row.get("nonce_dek2"),
        })
    };
    let provider: String = row.get("provider");
    let stroke_count: i64 = row.get("stroke_count");
    let key_version: i64 = row.get("key_version");
    User {
        id: row.get("id"),
        provider: Provider::parse(&provider).unwrap_or(Provider::Google),
        provider_id: row.get("provider_id"),
        username: row.get("username"),
        created_at: row.get("created_at"),
        stroke_count: u64::try_from(stroke_count).unwrap_or(0),
        key_version: u32::try_from(key_version).unwrap_or(0),
        envelope,
    }
}

fn row_to_record(row: &PgRow) -> StrokeRecord {
    StrokeRecord {
        page_key: row.get("page_key"),
        layer: layer_from_db(row.get("layer")),
        layer_id: row.get("layer_id"),
        stroke: Stroke {
            id: row.get("stroke_id"),
            user_id: row.get("user_id"),
            nonce: row.get("nonce"),
            content: row.get("content"),
        },
    }
}

const USER_COLUMNS: &str = "provider, provider_id, id, username, created_at, stroke_count, \
     key_version, salt_kek, encrypted_dek1, nonce_dek1, encrypted_dek2, nonce_dek2";

#[async_trait]
impl Store for PgStore {
    async fn get_or_create_user(
        &self,
        provider: Provider,
        provider_id: &str,
        username: &str,
    ) -> Result<User, StoreError> {
        let fresh_id = Uuid::new_v4().to_string();
        with_deadline(async {
            let row = sqlx::query(&format!(
                "INSERT INTO users (provider, provider_id, id, username)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (provider, provider_id) DO UPDATE SET username = EXCLUDED.username
                 RETURNING {USER_COLUMNS}"
            ))
            .bind(provider.as_str())
            .bind(provider_id)
            .bind(&fresh_id)
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
            Ok(row_to_user(&row))
        })
        .await
    }

    async fn get_user(
        &self,
        provider: Provider,
        provider_id: &str,
    ) -> Result<Option<User>, StoreError> {
        with_deadline(async {
            let row = sqlx::query(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE provider = $1 AND provider_id = $2"
            ))
            .bind(provider.as_str())
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.as_ref().map(row_to_user))
        })
        .await
    }

    async fn newest_page_strokes(
        &self,
        page_key: &str,
        limit: usize,
    ) -> Result<Vec<StrokeRecord>, StoreError> {
        with_deadline(async {
            let rows = sqlx::query(
                "SELECT page_key, stroke_id, user_id, layer, layer_id, nonce, content
                 FROM strokes WHERE page_key = $1
                 ORDER BY stroke_id DESC LIMIT $2",
            )
            .bind(page_key)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.iter().map(row_to_record).collect())
        })
        .await
    }

    async fn batch_write_strokes(
        &self,
        records: Vec<StrokeRecord>,
    ) -> Result<Vec<StrokeRecord>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO strokes (page_key, stroke_id, user_id, layer, layer_id, nonce, content) ",
        );
        builder.push_values(&records, |mut b, record| {
            b.push_bind(&record.page_key)
                .push_bind(&record.stroke.id)
                .push_bind(&record.stroke.user_id)
                .push_bind(layer_to_db(record.layer))
                .push_bind(&record.layer_id)
                .push_bind(&record.stroke.nonce)
                .push_bind(&record.stroke.content);
        });
        builder.push(" ON CONFLICT (page_key, stroke_id) DO NOTHING");

        let outcome = with_deadline(async {
            builder.build().execute(&self.pool).await?;
            Ok(())
        })
        .await;
        match outcome {
            // The statement is atomic: either every row is in (conflicts
            // were already persisted), or none are.
            Ok(()) => Ok(Vec::new()),
            Err(err) => {
                tracing::warn!(error = %err, rows = records.len(), "stroke batch write failed");
                Ok(records)
            }
        }
    }

    async fn delete_stroke_if_owner(
        &self,
        page_key: &str,
        stroke_id: &str,
        user_id: &str,
    ) -> Result<DeleteOutcome, StoreError> {
        with_deadline(async {
            let result = sqlx::query(
                "DELETE FROM strokes WHERE page_key = $1 AND stroke_id = $2 AND user_id = $3",
            )
            .bind(page_key)
            .bind(stroke_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                Ok(DeleteOutcome::Deleted)
            } else {
                Ok(DeleteOutcome::NotOwner)
            }
        })
        .await
    }

    async fn delete_user(&self, provider: Provider, provider_id: &str) -> Result<(), StoreError> {
        with_deadline(async {
            sqlx::query("DELETE FROM users WHERE provider = $1 AND provider_id = $2")
                .bind(provider.as_str())
                .bind(provider_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_user_strokes_batch(
        &self,
        user_id: &str,
        layer: Option<&LayerSelector>,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        with_deadline(async {
            let result = match layer {
                Some(selector) => {
                    sqlx::query(
                        "DELETE FROM strokes WHERE (page_key, stroke_id) IN (
                             SELECT page_key, stroke_id FROM strokes
                             WHERE user_id = $1 AND layer = $2 AND layer_id = $3 LIMIT $4)",
                    )
                    .bind(user_id)
                    .bind(layer_to_db(selector.layer))
                    .bind(&selector.layer_id)
                    .bind(limit)
                    .execute(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query(
                        "DELETE FROM strokes WHERE (page_key, stroke_id) IN (
                             SELECT page_key, stroke_id FROM strokes
                             WHERE user_id = $1 LIMIT $2)",
                    )
                    .bind(user_id)
                    .bind(limit)
                    .execute(&self.pool)
                    .await?
                }
            };
            Ok(result.rows_affected())
        })
        .await
    }

    async fn list_user_page_keys(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        with_deadline(async {
            let rows = sqlx::query("SELECT DISTINCT page_key FROM strokes WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows.iter().map(|r| r.get("page_key")).collect())
        })
        .await
    }

    async fn count_user_strokes(
        &self,
        user_id: &str,
        layer: Option<&LayerSelector>,
    ) -> Result<u64, StoreError> {
        with_deadline(async {
            let count: i64 = match layer {
                Some(selector) => {
                    sqlx::query_scalar(
                        "SELECT COUNT(*) FROM strokes
                         WHERE user_id = $1 AND layer = $2 AND layer_id = $3",
                    )
                    .bind(user_id)
                    .bind(layer_to_db(selector.layer))
                    .bind(&selector.layer_id)
                    .fetch_one(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_scalar("SELECT COUNT(*) FROM strokes WHERE user_id = $1")
                        .bind(user_id)
                        .fetch_one(&self.pool)
                        .await?
                }
            };
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn set_envelope(
        &self,
        provider: Provider,
        provider_id: &str,
        envelope: Option<&KeyEnvelope>,
        bump_version: bool,
    ) -> Result<u32, StoreError> {
        let cleared = KeyEnvelope::default();
        let envelope = envelope.unwrap_or(&cleared);
        with_deadline(async {
            let row = sqlx::query(
                "UPDATE users SET
                     salt_kek = $3, encrypted_dek1 = $4, nonce_dek1 = $5,
                     encrypted_dek2 = $6, nonce_dek2 = $7,
                     key_version = key_version + $8
                 WHERE provider = $1 AND provider_id = $2
                 RETURNING key_version",
            )
            .bind(provider.as_str())
            .bind(provider_id)
            .bind(&envelope.salt_kek)
            .bind(&envelope.encrypted_dek1)
            .bind(&envelope.nonce_dek1)
            .bind(&envelope.encrypted_dek2)
            .bind(&envelope.nonce_dek2)
            .bind(i64::from(bump_version))
            .fetch_optional(&self.pool)
            .await?;
            let row = row.ok_or_else(|| StoreError::Other("user not found".to_owned()))?;
            let version: i64 = row.get("key_version");
            Ok(u32::try_from(version).unwrap_or(0))
        })
        .await
    }

    async fn increment_stroke_count(
        &self,
        provider: Provider,
        provider_id: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        with_deadline(async {
            // Conditional on user existence: no upsert, so flushes that
            // land after account deletion cannot resurrect the row.
            sqlx::query(
                "UPDATE users SET stroke_count = GREATEST(stroke_count + $3, 0)
                 WHERE provider = $1 AND provider_id = $2",
            )
            .bind(provider.as_str())
            .bind(provider_id)
            .bind(delta)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
