use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crmflow_ai::StageOutput;
use crmflow_core::{MessageId, OrganizationId, WorkerGroup};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Incoming => "incoming",
            MessageDirection::Outgoing => "outgoing",
        }
    }
}

/// A messenger message as stored by the integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub organization_id: OrganizationId,
    pub direction: MessageDirection,
    /// `None` for media-only messages.
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn incoming(organization_id: OrganizationId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            organization_id,
            direction: MessageDirection::Incoming,
            content: Some(content.into()),
            created_at: Utc::now(),
        }
    }

    /// Counted by backfill: incoming with non-null content.
    pub fn is_backfill_candidate(&self) -> bool {
        self.direction == MessageDirection::Incoming && self.content.is_some()
    }
}

/// Output of one stage for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub organization_id: OrganizationId,
    pub message_id: MessageId,
    pub output: StageOutput,
    pub created_at: DateTime<Utc>,
}

impl DerivedRecord {
    pub fn new(organization_id: OrganizationId, message_id: MessageId, output: StageOutput) -> Self {
        Self {
            organization_id,
            message_id,
            output,
            created_at: Utc::now(),
        }
    }

    pub fn group(&self) -> WorkerGroup {
        self.output.group()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record: {0}")]
    Decode(String),
}

/// Read access to source messages.
#[async_trait::async_trait]
pub trait MessageSource: Send + Sync {
    /// Ids of up to `limit` incoming messages with content, most recent first.
    async fn recent_with_content(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<MessageId>, MessageStoreError>;

    async fn load(&self, message_id: MessageId) -> Result<Option<Message>, MessageStoreError>;
}

/// Derived records, one table per worker group.
#[async_trait::async_trait]
pub trait DerivedRecordStore: Send + Sync {
    /// Subset of `message_ids` that already have a record for `group`.
    async fn existing(
        &self,
        group: WorkerGroup,
        organization_id: OrganizationId,
        message_ids: &[MessageId],
    ) -> Result<HashSet<MessageId>, MessageStoreError>;

    /// Normalized text of an organization's message, once the `normalize` stage has run.
    async fn normalized_text(
        &self,
        organization_id: OrganizationId,
        message_id: MessageId,
    ) -> Result<Option<String>, MessageStoreError>;

    /// Insert or replace the record for `(group, message_id)`.
    async fn save(&self, record: &DerivedRecord) -> Result<(), MessageStoreError>;
}

#[async_trait::async_trait]
impl<T: MessageSource + ?Sized> MessageSource for std::sync::Arc<T> {
    async fn recent_with_content(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<MessageId>, MessageStoreError> {
        (**self).recent_with_content(organization_id, limit).await
    }

    async fn load(&self, message_id: MessageId) -> Result<Option<Message>, MessageStoreError> {
        (**self).load(message_id).await
    }
}

#[async_trait::async_trait]
impl<T: DerivedRecordStore + ?Sized> DerivedRecordStore for std::sync::Arc<T> {
    async fn existing(
        &self,
        group: WorkerGroup,
        organization_id: OrganizationId,
        message_ids: &[MessageId],
    ) -> Result<HashSet<MessageId>, MessageStoreError> {
        (**self).existing(group, organization_id, message_ids).await
    }

    async fn normalized_text(
        &self,
        organization_id: OrganizationId,
        message_id: MessageId,
    ) -> Result<Option<String>, MessageStoreError> {
        (**self).normalized_text(organization_id, message_id).await
    }

    async fn save(&self, record: &DerivedRecord) -> Result<(), MessageStoreError> {
        (**self).save(record).await
    }
}
