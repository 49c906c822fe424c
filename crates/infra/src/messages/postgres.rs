//! Postgres adapters for `messages` and the derived-record tables.
//!
//! | Worker group | Table                 | Payload columns                            |
//! |--------------|-----------------------|--------------------------------------------|
//! | `normalize`  | `normalized_messages` | `normalized_text`, `language`, `token_count` |
//! | `embed`      | `message_embeddings`  | `model`, `dimensions`, `embedding REAL[]`  |
//! | `annotate`   | `message_annotations` | `primary_label`, `labels JSONB`            |
//!
//! Every derived table is keyed by `message_id`; saves are upserts, so a retried job
//! overwrites rather than duplicates.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crmflow_ai::StageOutput;
use crmflow_core::{MessageId, OrganizationId, WorkerGroup};

use super::types::{
    DerivedRecord, DerivedRecordStore, Message, MessageDirection, MessageSource, MessageStoreError,
};
use crate::db::describe_sqlx_error;

fn table_for(group: WorkerGroup) -> &'static str {
    match group {
        WorkerGroup::Normalize => "normalized_messages",
        WorkerGroup::Embed => "message_embeddings",
        WorkerGroup::Annotate => "message_annotations",
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> MessageStoreError {
    MessageStoreError::Storage(describe_sqlx_error(operation, &err))
}

#[derive(Debug, Clone)]
pub struct PostgresMessageStore {
    pool: Arc<PgPool>,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl MessageSource for PostgresMessageStore {
    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    async fn recent_with_content(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<MessageId>, MessageStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM messages
            WHERE organization_id = $1
              AND direction = 'incoming'
              AND content IS NOT NULL
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_with_content", e))?;

        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("id").map(MessageId::from_uuid))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("recent_with_content", e))
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn load(&self, message_id: MessageId) -> Result<Option<Message>, MessageStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, direction, content, created_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(message_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_message", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e: sqlx::Error| MessageStoreError::Decode(e.to_string());
        let direction: String = row.try_get("direction").map_err(decode)?;
        let organization_id: Uuid = row.try_get("organization_id").map_err(decode)?;

        Ok(Some(Message {
            id: message_id,
            organization_id: organization_id.into(),
            direction: match direction.as_str() {
                "incoming" => MessageDirection::Incoming,
                _ => MessageDirection::Outgoing,
            },
            content: row.try_get("content").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresDerivedStore {
    pool: Arc<PgPool>,
}

impl PostgresDerivedStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl DerivedRecordStore for PostgresDerivedStore {
    #[instrument(
        skip(self, message_ids),
        fields(organization_id = %organization_id, candidates = message_ids.len()),
        err
    )]
    async fn existing(
        &self,
        group: WorkerGroup,
        organization_id: OrganizationId,
        message_ids: &[MessageId],
    ) -> Result<HashSet<MessageId>, MessageStoreError> {
        if message_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let ids: Vec<Uuid> = message_ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(&format!(
            "SELECT message_id FROM {} WHERE organization_id = $1 AND message_id = ANY($2)",
            table_for(group)
        ))
        .bind(organization_id.as_uuid())
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("existing_derived", e))?;

        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("message_id").map(MessageId::from_uuid))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| map_sqlx_error("existing_derived", e))
    }

    #[instrument(skip(self), fields(organization_id = %organization_id, message_id = %message_id), err)]
    async fn normalized_text(
        &self,
        organization_id: OrganizationId,
        message_id: MessageId,
    ) -> Result<Option<String>, MessageStoreError> {
        let row = sqlx::query(
            "SELECT normalized_text FROM normalized_messages \
             WHERE message_id = $1 AND organization_id = $2",
        )
        .bind(message_id.as_uuid())
        .bind(organization_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("normalized_text", e))?;

        row.map(|r| r.try_get::<String, _>("normalized_text"))
            .transpose()
            .map_err(|e| map_sqlx_error("normalized_text", e))
    }

    #[instrument(
        skip(self, record),
        fields(message_id = %record.message_id, worker_group = %record.group()),
        err
    )]
    async fn save(&self, record: &DerivedRecord) -> Result<(), MessageStoreError> {
        let org = record.organization_id.as_uuid();
        let message = record.message_id.as_uuid();

        let result = match &record.output {
            StageOutput::Normalized(n) => {
                sqlx::query(
                    r#"
                    INSERT INTO normalized_messages
                        (message_id, organization_id, normalized_text, language, token_count, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (message_id) DO UPDATE
                    SET normalized_text = EXCLUDED.normalized_text,
                        language = EXCLUDED.language,
                        token_count = EXCLUDED.token_count
                    WHERE normalized_messages.organization_id = EXCLUDED.organization_id
                    "#,
                )
                .bind(message)
                .bind(org)
                .bind(&n.text)
                .bind(serde_plain(&n.language)?)
                .bind(n.token_count as i32)
                .bind(record.created_at)
                .execute(&*self.pool)
                .await
            }
            StageOutput::Embedding(e) => {
                sqlx::query(
                    r#"
                    INSERT INTO message_embeddings
                        (message_id, organization_id, model, dimensions, embedding, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (message_id) DO UPDATE
                    SET model = EXCLUDED.model,
                        dimensions = EXCLUDED.dimensions,
                        embedding = EXCLUDED.embedding
                    WHERE message_embeddings.organization_id = EXCLUDED.organization_id
                    "#,
                )
                .bind(message)
                .bind(org)
                .bind(&e.model)
                .bind(e.dimensions as i32)
                .bind(&e.vector)
                .bind(record.created_at)
                .execute(&*self.pool)
                .await
            }
            StageOutput::Annotation(a) => {
                let labels = serde_json::to_value(&a.labels)
                    .map_err(|e| MessageStoreError::Decode(e.to_string()))?;
                let primary = a.primary.as_ref().map(serde_plain).transpose()?;
                sqlx::query(
                    r#"
                    INSERT INTO message_annotations
                        (message_id, organization_id, primary_label, labels, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (message_id) DO UPDATE
                    SET primary_label = EXCLUDED.primary_label,
                        labels = EXCLUDED.labels
                    WHERE message_annotations.organization_id = EXCLUDED.organization_id
                    "#,
                )
                .bind(message)
                .bind(org)
                .bind(primary)
                .bind(labels)
                .bind(record.created_at)
                .execute(&*self.pool)
                .await
            }
        };

        result
            .map(|_| ())
            .map_err(|e| map_sqlx_error("save_derived", e))
    }
}

/// Serialize a unit enum to its bare wire name (`"ru"`, `"payment"`).
fn serde_plain<T: serde::Serialize>(value: &T) -> Result<String, MessageStoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(MessageStoreError::Decode(format!("expected string, got {other}"))),
        Err(e) => Err(MessageStoreError::Decode(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmflow_ai::{IntentLabel, Language};

    #[test]
    fn each_group_has_its_own_table() {
        let tables: HashSet<_> = WorkerGroup::ALL.iter().map(|g| table_for(*g)).collect();
        assert_eq!(tables.len(), 3);
        assert_eq!(table_for(WorkerGroup::Normalize), "normalized_messages");
    }

    #[test]
    fn unit_enums_serialize_to_bare_names() {
        assert_eq!(serde_plain(&Language::Ru).unwrap(), "ru");
        assert_eq!(serde_plain(&IntentLabel::Cancellation).unwrap(), "cancellation");
        assert!(serde_plain(&vec![1]).is_err());
    }
}
