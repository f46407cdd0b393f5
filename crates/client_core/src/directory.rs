use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, UserId},
    protocol::ConversationSummary,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    error::{MessagingError, Result},
    types::{ConversationEntry, ConversationKey},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchTarget {
    Conversation(ConversationId),
    Peer(UserId),
    Confirmed {
        conversation_id: ConversationId,
        peer_id: UserId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchOutcome {
    pub key: ConversationKey,
    pub replaced_placeholder: Option<ConversationKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedPlaceholder {
    pub peer_id: UserId,
    pub placeholder: ConversationKey,
    pub conversation_id: ConversationId,
}

struct Slot {
    entry: ConversationEntry,
    touched: u64,
}

#[derive(Default)]
struct DirectoryState {
    slots: Vec<Slot>,
    touch_seq: u64,
}

impl DirectoryState {
    fn position_by_peer(&self, peer_id: UserId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.entry.peer_id == peer_id)
    }

    fn position_by_key(&self, key: ConversationKey) -> Option<usize> {
        self.slots.iter().position(|slot| slot.entry.key == key)
    }

    fn next_seq(&mut self) -> u64 {
        self.touch_seq += 1;
        self.touch_seq
    }

    fn resort(&mut self) {
        self.slots.sort_by(|a, b| {
            b.entry
                .last_message_at
                .cmp(&a.entry.last_message_at)
                .then(b.touched.cmp(&a.touched))
        });
    }

    fn confirm_slot(
        &mut self,
        index: usize,
        conversation_id: ConversationId,
    ) -> Option<ConversationKey> {
        let slot = &mut self.slots[index];
        let previous = slot.entry.key;
        slot.entry.key = ConversationKey::Confirmed(conversation_id);
        if previous.is_provisional() {
            info!(
                peer_id = slot.entry.peer_id.0,
                conversation_id = conversation_id.0,
                "directory: placeholder conversation confirmed"
            );
            Some(previous)
        } else {
            None
        }
    }
}

#[derive(Clone, Default)]
pub struct ConversationDirectory {
    inner: Arc<RwLock<DirectoryState>>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self) -> Vec<ConversationEntry> {
        self.inner
            .read()
            .await
            .slots
            .iter()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    pub async fn get(&self, key: ConversationKey) -> Option<ConversationEntry> {
        let guard = self.inner.read().await;
        guard
            .position_by_key(key)
            .map(|index| guard.slots[index].entry.clone())
    }

    pub async fn find_by_peer(&self, peer_id: UserId) -> Option<ConversationEntry> {
        let guard = self.inner.read().await;
        guard
            .position_by_peer(peer_id)
            .map(|index| guard.slots[index].entry.clone())
    }

    pub async fn ensure_peer(
        &self,
        peer_id: UserId,
        display_name: Option<String>,
    ) -> ConversationKey {
        let mut guard = self.inner.write().await;
        if let Some(index) = guard.position_by_peer(peer_id) {
            let slot = &mut guard.slots[index];
            if slot.entry.peer_display_name.is_none() {
                slot.entry.peer_display_name = display_name;
            }
            return slot.entry.key;
        }
        let key = ConversationKey::Provisional(peer_id);
        let touched = guard.next_seq();
        guard.slots.push(Slot {
            entry: ConversationEntry {
                key,
                peer_id,
                peer_display_name: display_name,
                last_message_preview: None,
                last_message_at: None,
            },
            touched,
        });
        guard.resort();
        key
    }

    pub async fn touch(
        &self,
        target: TouchTarget,
        preview: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<TouchOutcome> {
        let preview = preview.into();
        let mut guard = self.inner.write().await;

        let (index, replaced_placeholder) = match target {
            TouchTarget::Conversation(conversation_id) => {
                let index = guard
                    .position_by_key(ConversationKey::Confirmed(conversation_id))
                    .ok_or(MessagingError::UnknownConversation(conversation_id))?;
                (index, None)
            }
            TouchTarget::Peer(peer_id) => match guard.position_by_peer(peer_id) {
                Some(index) => (index, None),
                None => {
                    guard.slots.push(Slot {
                        entry: ConversationEntry {
                            key: ConversationKey::Provisional(peer_id),
                            peer_id,
                            peer_display_name: None,
                            last_message_preview: None,
                            last_message_at: None,
                        },
                        touched: 0,
                    });
                    (guard.slots.len() - 1, None)
                }
            },
            TouchTarget::Confirmed {
                conversation_id,
                peer_id,
            } => match guard.position_by_peer(peer_id) {
                Some(index) => {
                    let replaced = guard.confirm_slot(index, conversation_id);
                    (index, replaced)
                }
                None => {
                    guard.slots.push(Slot {
                        entry: ConversationEntry {
                            key: ConversationKey::Confirmed(conversation_id),
                            peer_id,
                            peer_display_name: None,
                            last_message_preview: None,
                            last_message_at: None,
                        },
                        touched: 0,
                    });
                    (guard.slots.len() - 1, None)
                }
            },
        };

        let touched = guard.next_seq();
        let slot = &mut guard.slots[index];
        slot.touched = touched;
        let is_newer = slot.entry.last_message_at.map_or(true, |current| at >= current);
        if is_newer {
            slot.entry.last_message_at = Some(at);
            slot.entry.last_message_preview = Some(preview);
        }
        let key = slot.entry.key;
        guard.resort();

        Ok(TouchOutcome {
            key,
            replaced_placeholder,
        })
    }

    pub async fn confirm(
        &self,
        peer_id: UserId,
        conversation_id: ConversationId,
        display_name: Option<String>,
    ) -> Option<ConversationKey> {
        let mut guard = self.inner.write().await;
        match guard.position_by_peer(peer_id) {
            Some(index) => {
                if display_name.is_some() {
                    guard.slots[index].entry.peer_display_name = display_name;
                }
                guard.confirm_slot(index, conversation_id)
            }
            None => {
                guard.slots.push(Slot {
                    entry: ConversationEntry {
                        key: ConversationKey::Confirmed(conversation_id),
                        peer_id,
                        peer_display_name: display_name,
                        last_message_preview: None,
                        last_message_at: None,
                    },
                    touched: 0,
                });
                guard.resort();
                None
            }
        }
    }

    /// Merges a fetched directory listing. Local recency wins when it is newer
    /// than the listing. Returns every placeholder the listing confirmed.
    pub async fn merge_listing(
        &self,
        self_id: UserId,
        summaries: &[ConversationSummary],
    ) -> Vec<ConfirmedPlaceholder> {
        let mut confirmed = Vec::new();
        let mut guard = self.inner.write().await;
        for summary in summaries {
            let peer_id = summary.peer_id(self_id);
            let index = match guard.position_by_peer(peer_id) {
                Some(index) => {
                    if let Some(placeholder) = guard.confirm_slot(index, summary.id) {
                        confirmed.push(ConfirmedPlaceholder {
                            peer_id,
                            placeholder,
                            conversation_id: summary.id,
                        });
                    }
                    index
                }
                None => {
                    guard.slots.push(Slot {
                        entry: ConversationEntry {
                            key: ConversationKey::Confirmed(summary.id),
                            peer_id,
                            peer_display_name: None,
                            last_message_preview: None,
                            last_message_at: None,
                        },
                        touched: 0,
                    });
                    guard.slots.len() - 1
                }
            };

            let entry = &mut guard.slots[index].entry;
            if let Some(name) = summary.peer_display_name() {
                entry.peer_display_name = Some(name);
            }
            if let Some(at) = summary.last_message_timestamp {
                if entry.last_message_at.map_or(true, |current| at > current) {
                    entry.last_message_at = Some(at);
                    if summary.last_message_content.is_some() {
                        entry.last_message_preview = summary.last_message_content.clone();
                    }
                }
            } else if entry.last_message_preview.is_none() {
                entry.last_message_preview = summary.last_message_content.clone();
            }
        }
        guard.resort();
        confirmed
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
