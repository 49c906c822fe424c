//! In-memory message and derived-record stores for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crmflow_ai::{NormalizedText, StageOutput};
use crmflow_core::{MessageId, OrganizationId, WorkerGroup};

use super::types::{DerivedRecord, DerivedRecordStore, Message, MessageSource, MessageStoreError};

fn poisoned() -> MessageStoreError {
    MessageStoreError::Storage("message store lock poisoned".to_string())
}

#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, message: Message) -> Result<(), MessageStoreError> {
        self.messages
            .write()
            .map_err(|_| poisoned())?
            .insert(message.id, message);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageSource for InMemoryMessageStore {
    async fn recent_with_content(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<MessageId>, MessageStoreError> {
        let messages = self.messages.read().map_err(|_| poisoned())?;
        let mut candidates: Vec<_> = messages
            .values()
            .filter(|m| m.organization_id == organization_id && m.is_backfill_candidate())
            .collect();

        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(candidates
            .into_iter()
            .take(limit as usize)
            .map(|m| m.id)
            .collect())
    }

    async fn load(&self, message_id: MessageId) -> Result<Option<Message>, MessageStoreError> {
        let messages = self.messages.read().map_err(|_| poisoned())?;
        Ok(messages.get(&message_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDerivedStore {
    records: RwLock<HashMap<(WorkerGroup, MessageId), DerivedRecord>>,
}

impl InMemoryDerivedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        group: WorkerGroup,
        message_id: MessageId,
    ) -> Result<Option<DerivedRecord>, MessageStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&(group, message_id)).cloned())
    }

    pub fn count(&self, group: WorkerGroup) -> Result<usize, MessageStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.keys().filter(|(g, _)| *g == group).count())
    }
}

#[async_trait::async_trait]
impl DerivedRecordStore for InMemoryDerivedStore {
    async fn existing(
        &self,
        group: WorkerGroup,
        organization_id: OrganizationId,
        message_ids: &[MessageId],
    ) -> Result<HashSet<MessageId>, MessageStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(message_ids
            .iter()
            .filter(|id| {
                records
                    .get(&(group, **id))
                    .is_some_and(|r| r.organization_id == organization_id)
            })
            .copied()
            .collect())
    }

    async fn normalized_text(
        &self,
        organization_id: OrganizationId,
        message_id: MessageId,
    ) -> Result<Option<String>, MessageStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .get(&(WorkerGroup::Normalize, message_id))
            .filter(|r| r.organization_id == organization_id)
            .and_then(|r| match &r.output {
                StageOutput::Normalized(NormalizedText { text, .. }) => Some(text.clone()),
                _ => None,
            }))
    }

    async fn save(&self, record: &DerivedRecord) -> Result<(), MessageStoreError> {
        self.records
            .write()
            .map_err(|_| poisoned())?
            .insert((record.group(), record.message_id), record.clone());
        Ok(())
    }
}
