use std::{collections::HashMap, sync::Arc};

use shared::domain::{MessageId, MessageStatus, TempId, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::{ConversationKey, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Reconciled { temp_id: TempId },
    Merged,
    Unchanged,
}

impl AppendOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, AppendOutcome::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryMerge {
    pub inserted: usize,
    pub reconciled: usize,
    pub merged: usize,
    pub unchanged: usize,
}

#[derive(Default)]
struct LogState {
    logs: HashMap<ConversationKey, Vec<Message>>,
    by_id: HashMap<MessageId, ConversationKey>,
    by_temp: HashMap<TempId, ConversationKey>,
}

impl LogState {
    fn append(&mut self, key: ConversationKey, mut message: Message) -> AppendOutcome {
        message.conversation = key;

        if let Some(message_id) = message.message_id {
            if let Some(existing_key) = self.by_id.get(&message_id).copied() {
                return self.merge_existing(existing_key, message_id, message);
            }
        }

        if let Some(temp_id) = message.temp_id.clone() {
            if let Some(existing_key) = self.by_temp.get(&temp_id).copied() {
                if message.is_provisional() {
                    return AppendOutcome::Unchanged;
                }
                if let Some(outcome) = self.reconcile(existing_key, key, &temp_id, message.clone())
                {
                    return outcome;
                }
                // Already reconciled to another id: the server stored a resend twice.
                debug!(
                    temp_id = %temp_id,
                    message_id = ?message.message_id,
                    "log: dropping second confirmation for reconciled send"
                );
                return AppendOutcome::Unchanged;
            }
        }

        self.index(key, &message);
        insert_sorted(self.logs.entry(key).or_default(), message);
        AppendOutcome::Inserted
    }

    fn merge_existing(
        &mut self,
        key: ConversationKey,
        message_id: MessageId,
        incoming: Message,
    ) -> AppendOutcome {
        // A history row without a temp id may have landed first; the echo
        // then still has to retire the provisional twin.
        let retired = incoming
            .temp_id
            .clone()
            .filter(|temp_id| self.remove_provisional(temp_id).is_some());

        let Some(entry) = self
            .logs
            .get_mut(&key)
            .and_then(|log| log.iter_mut().find(|m| m.message_id == Some(message_id)))
        else {
            return AppendOutcome::Unchanged;
        };

        let mut changed = false;
        if incoming.status.is_after(entry.status) {
            entry.status = incoming.status;
            changed = true;
        }
        if entry.temp_id.is_none() {
            if let Some(temp_id) = incoming.temp_id {
                entry.temp_id = Some(temp_id.clone());
                self.by_temp.insert(temp_id, key);
            }
        }

        if let Some(temp_id) = retired {
            self.by_temp.insert(temp_id.clone(), key);
            debug!(
                conversation = %key,
                temp_id = %temp_id,
                message_id = message_id.0,
                "log: provisional message retired by existing confirmation"
            );
            return AppendOutcome::Reconciled { temp_id };
        }
        if changed {
            AppendOutcome::Merged
        } else {
            AppendOutcome::Unchanged
        }
    }

    fn reconcile(
        &mut self,
        existing_key: ConversationKey,
        incoming_key: ConversationKey,
        temp_id: &TempId,
        mut confirmed: Message,
    ) -> Option<AppendOutcome> {
        let target_key = if existing_key != incoming_key
            && existing_key.is_provisional()
            && !incoming_key.is_provisional()
        {
            self.rekey(existing_key, incoming_key);
            incoming_key
        } else {
            existing_key
        };

        let log = self.logs.get_mut(&target_key)?;
        let position = log
            .iter()
            .position(|m| m.is_provisional() && m.temp_id.as_ref() == Some(temp_id))?;
        let provisional = log.remove(position);

        confirmed.conversation = target_key;
        if !confirmed.status.has_reached(MessageStatus::Sent) {
            confirmed.status = MessageStatus::Sent;
        }
        debug!(
            conversation = %target_key,
            temp_id = %temp_id,
            message_id = ?confirmed.message_id,
            previous_status = %provisional.status,
            "log: provisional message reconciled"
        );
        if let Some(message_id) = confirmed.message_id {
            self.by_id.insert(message_id, target_key);
        }
        insert_sorted(log, confirmed);
        Some(AppendOutcome::Reconciled {
            temp_id: temp_id.clone(),
        })
    }

    fn remove_provisional(&mut self, temp_id: &TempId) -> Option<Message> {
        let key = self.by_temp.get(temp_id).copied()?;
        let log = self.logs.get_mut(&key)?;
        let position = log
            .iter()
            .position(|m| m.is_provisional() && m.temp_id.as_ref() == Some(temp_id))?;
        Some(log.remove(position))
    }

    fn index(&mut self, key: ConversationKey, message: &Message) {
        if let Some(message_id) = message.message_id {
            self.by_id.insert(message_id, key);
        }
        if let Some(temp_id) = &message.temp_id {
            self.by_temp.insert(temp_id.clone(), key);
        }
    }

    fn rekey(&mut self, from: ConversationKey, to: ConversationKey) -> usize {
        if from == to {
            return 0;
        }
        let Some(moved) = self.logs.remove(&from) else {
            return 0;
        };
        let count = moved.len();
        for mut message in moved {
            message.conversation = to;
            self.index(to, &message);
            let log = self.logs.entry(to).or_default();
            let duplicate = message.message_id.is_some()
                && log.iter().any(|m| m.message_id == message.message_id);
            if !duplicate {
                insert_sorted(log, message);
            }
        }
        info!(from = %from, to = %to, moved = count, "log: conversation rekeyed");
        count
    }

    fn find_provisional_mut(&mut self, temp_id: &TempId) -> Option<&mut Message> {
        let key = self.by_temp.get(temp_id).copied()?;
        self.logs
            .get_mut(&key)?
            .iter_mut()
            .find(|m| m.is_provisional() && m.temp_id.as_ref() == Some(temp_id))
    }
}

fn insert_sorted(log: &mut Vec<Message>, message: Message) {
    let key = message.sort_key();
    let position = log.partition_point(|existing| existing.sort_key() <= key);
    log.insert(position, message);
}

#[derive(Clone, Default)]
pub struct MessageLogStore {
    inner: Arc<RwLock<LogState>>,
}

impl MessageLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, key: ConversationKey, message: Message) -> AppendOutcome {
        self.inner.write().await.append(key, message)
    }

    pub async fn update_status(&self, message_id: MessageId, status: MessageStatus) -> bool {
        let mut guard = self.inner.write().await;
        let Some(key) = guard.by_id.get(&message_id).copied() else {
            return false;
        };
        let Some(entry) = guard
            .logs
            .get_mut(&key)
            .and_then(|log| log.iter_mut().find(|m| m.message_id == Some(message_id)))
        else {
            return false;
        };
        if !status.is_after(entry.status) {
            debug!(
                message_id = message_id.0,
                current = %entry.status,
                ignored = %status,
                "log: stale status update ignored"
            );
            return false;
        }
        entry.status = status;
        true
    }

    pub async fn load_history(
        &self,
        key: ConversationKey,
        page: impl IntoIterator<Item = Message>,
    ) -> HistoryMerge {
        let mut merge = HistoryMerge::default();
        let mut guard = self.inner.write().await;
        for message in page {
            match guard.append(key, message) {
                AppendOutcome::Inserted => merge.inserted += 1,
                AppendOutcome::Reconciled { .. } => merge.reconciled += 1,
                AppendOutcome::Merged => merge.merged += 1,
                AppendOutcome::Unchanged => merge.unchanged += 1,
            }
        }
        merge
    }

    pub async fn rekey(&self, from: ConversationKey, to: ConversationKey) -> usize {
        self.inner.write().await.rekey(from, to)
    }

    pub async fn mark_failed(&self, temp_id: &TempId) -> bool {
        let mut guard = self.inner.write().await;
        match guard.find_provisional_mut(temp_id) {
            Some(entry) if entry.status == MessageStatus::Pending => {
                entry.status = MessageStatus::Failed;
                true
            }
            _ => false,
        }
    }

    pub async fn mark_pending(&self, temp_id: &TempId) -> bool {
        let mut guard = self.inner.write().await;
        match guard.find_provisional_mut(temp_id) {
            Some(entry) if entry.status == MessageStatus::Failed => {
                entry.status = MessageStatus::Pending;
                true
            }
            _ => false,
        }
    }

    /// Removes a failed, unconfirmed message. Nothing else is ever removed.
    pub async fn discard(&self, temp_id: &TempId) -> Option<Message> {
        let mut guard = self.inner.write().await;
        let key = guard.by_temp.get(temp_id).copied()?;
        let log = guard.logs.get_mut(&key)?;
        let position = log.iter().position(|m| {
            m.is_provisional()
                && m.status == MessageStatus::Failed
                && m.temp_id.as_ref() == Some(temp_id)
        })?;
        let removed = log.remove(position);
        guard.by_temp.remove(temp_id);
        Some(removed)
    }

    pub async fn messages(&self, key: ConversationKey) -> Vec<Message> {
        self.inner
            .read()
            .await
            .logs
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, message_id: MessageId) -> Option<Message> {
        let guard = self.inner.read().await;
        let key = guard.by_id.get(&message_id)?;
        guard
            .logs
            .get(key)?
            .iter()
            .find(|m| m.message_id == Some(message_id))
            .cloned()
    }

    /// The entry that carries `temp_id`, provisional or already reconciled.
    pub async fn find_by_temp(&self, temp_id: &TempId) -> Option<Message> {
        let guard = self.inner.read().await;
        let key = guard.by_temp.get(temp_id)?;
        guard
            .logs
            .get(key)?
            .iter()
            .find(|m| m.temp_id.as_ref() == Some(temp_id))
            .cloned()
    }

    /// Confirmed inbound messages for `self_id` that have not reached `target`.
    pub async fn inbound_below(
        &self,
        self_id: UserId,
        target: MessageStatus,
        key: Option<ConversationKey>,
    ) -> Vec<MessageId> {
        let guard = self.inner.read().await;
        let logs: Vec<&Vec<Message>> = match key {
            Some(key) => guard.logs.get(&key).into_iter().collect(),
            None => guard.logs.values().collect(),
        };
        logs.into_iter()
            .flatten()
            .filter(|m| m.is_inbound_for(self_id) && !m.status.has_reached(target))
            .filter_map(|m| m.message_id)
            .collect()
    }

    /// Case-insensitive substring search over one conversation.
    pub async fn search(&self, key: ConversationKey, query: &str) -> Vec<Message> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.inner
            .read()
            .await
            .logs
            .get(&key)
            .map(|log| {
                log.iter()
                    .filter(|m| m.content.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn len(&self, key: ConversationKey) -> usize {
        self.inner
            .read()
            .await
            .logs
            .get(&key)
            .map_or(0, Vec::len)
    }

    pub async fn is_empty(&self, key: ConversationKey) -> bool {
        self.len(key).await == 0
    }
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
