use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use shared::domain::{MessageId, MessageStatus, UserId};
use tokio::{sync::broadcast, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    api::MessagingApi,
    config::{ReadPolicy, StatusSyncPolicy},
    error::{MessagingError, Result},
    message_log::MessageLogStore,
    types::ConversationKey,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted {
        from: MessageStatus,
        to: MessageStatus,
    },
    AlreadyReached(MessageStatus),
    NotInbound,
}

struct Inner {
    api: Arc<dyn MessagingApi>,
    log: MessageLogStore,
    self_id: UserId,
    policy: StatusSyncPolicy,
    read_policy: ReadPolicy,
    events: broadcast::Sender<ClientEvent>,
    locks: Mutex<HashMap<MessageId, Arc<Mutex<()>>>>,
    visible: Mutex<HashMap<MessageId, u64>>,
    visibility_seq: AtomicU64,
}

#[derive(Clone)]
pub struct StatusSynchronizer {
    inner: Arc<Inner>,
}

impl StatusSynchronizer {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        log: MessageLogStore,
        self_id: UserId,
        policy: StatusSyncPolicy,
        read_policy: ReadPolicy,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                log,
                self_id,
                policy,
                read_policy,
                events,
                locks: Mutex::new(HashMap::new()),
                visible: Mutex::new(HashMap::new()),
                visibility_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Brings `message_id` up to `target`, issuing one call per missing step.
    pub async fn promote(
        &self,
        message_id: MessageId,
        target: MessageStatus,
    ) -> Result<PromotionOutcome> {
        if !target.is_receiver_status() {
            return Err(MessagingError::StatusSync {
                message_id,
                status: target,
                reason: "not a receiver-side status".into(),
            });
        }

        let lock = self.message_lock(message_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.promote_locked(message_id, target).await
        };
        self.release_lock(message_id, lock).await;
        result
    }

    async fn promote_locked(
        &self,
        message_id: MessageId,
        target: MessageStatus,
    ) -> Result<PromotionOutcome> {
        let message = self
            .inner
            .log
            .get(message_id)
            .await
            .ok_or_else(|| MessagingError::UnknownMessage(message_id.to_string()))?;
        if !message.is_inbound_for(self.inner.self_id) {
            return Ok(PromotionOutcome::NotInbound);
        }
        if message.status.has_reached(target) {
            debug!(
                message_id = message_id.0,
                status = %message.status,
                target = %target,
                "status: already reached; skipping"
            );
            return Ok(PromotionOutcome::AlreadyReached(message.status));
        }

        let from = message.status;
        let mut current = from;
        for step in MessageStatus::RECEIVER_PROMOTIONS {
            if !step.is_after(current) || step.is_after(target) {
                continue;
            }
            self.report(message_id, step).await?;
            if self.inner.log.update_status(message_id, step).await {
                let _ = self.inner.events.send(ClientEvent::MessageStatusChanged {
                    conversation: message.conversation,
                    message_id,
                    status: step,
                });
            }
            current = step;
        }
        info!(
            message_id = message_id.0,
            from = %from,
            to = %current,
            "status: promoted"
        );
        Ok(PromotionOutcome::Promoted { from, to: current })
    }

    async fn report(&self, message_id: MessageId, status: MessageStatus) -> Result<()> {
        let policy = &self.inner.policy;
        let attempts = policy.max_attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(
                policy.request_timeout,
                self.inner.api.mark_status(message_id, status),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => reason = format!("{err:#}"),
                Err(_) => reason = "request timed out".into(),
            }
            debug!(
                message_id = message_id.0,
                status = %status,
                attempt,
                max_attempts = attempts,
                reason = %reason,
                "status: report attempt failed"
            );
            if attempt < attempts {
                tokio::time::sleep(policy.retry_delay.saturating_mul(attempt)).await;
            }
        }
        Err(MessagingError::StatusSync {
            message_id,
            status,
            reason,
        })
    }

    async fn message_lock(&self, message_id: MessageId) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .lock()
            .await
            .entry(message_id)
            .or_default()
            .clone()
    }

    async fn release_lock(&self, message_id: MessageId, lock: Arc<Mutex<()>>) {
        let mut locks = self.inner.locks.lock().await;
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&message_id);
        }
    }

    pub fn schedule(&self, message_id: MessageId, target: MessageStatus) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            match sync.promote(message_id, target).await {
                Ok(_) => {}
                Err(MessagingError::StatusSync {
                    message_id,
                    status,
                    reason,
                }) => {
                    warn!(
                        message_id = message_id.0,
                        status = %status,
                        reason = %reason,
                        "status: promotion deferred until next trigger"
                    );
                }
                Err(err) => {
                    debug!(message_id = message_id.0, error = %err, "status: promotion skipped");
                }
            }
        })
    }

    /// The user can now see `message_id`. Schedules `seen`, and `read` per
    /// the configured [`ReadPolicy`].
    pub async fn message_visible(&self, message_id: MessageId) -> JoinHandle<()> {
        let token = self.inner.visibility_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.visible.lock().await.insert(message_id, token);

        match self.inner.read_policy {
            ReadPolicy::SameAsSeen => self.schedule(message_id, MessageStatus::Read),
            ReadPolicy::Sustained { after } => {
                let sync = self.clone();
                tokio::spawn(async move {
                    let _ = sync.schedule(message_id, MessageStatus::Seen).await;
                    tokio::time::sleep(after).await;
                    let still_visible = sync
                        .inner
                        .visible
                        .lock()
                        .await
                        .get(&message_id)
                        .is_some_and(|current| *current == token);
                    if still_visible {
                        let _ = sync.schedule(message_id, MessageStatus::Read).await;
                    }
                })
            }
        }
    }

    pub async fn message_hidden(&self, message_id: MessageId) {
        self.inner.visible.lock().await.remove(&message_id);
    }

    pub async fn reconcile_pass(&self, key: Option<ConversationKey>) -> usize {
        let self_id = self.inner.self_id;
        let undelivered = self
            .inner
            .log
            .inbound_below(self_id, MessageStatus::Delivered, key)
            .await;
        let visible: HashSet<MessageId> =
            self.inner.visible.lock().await.keys().copied().collect();
        let unseen: Vec<MessageId> = self
            .inner
            .log
            .inbound_below(self_id, MessageStatus::Seen, key)
            .await
            .into_iter()
            .filter(|id| visible.contains(id))
            .collect();

        let mut scheduled = 0;
        for message_id in &unseen {
            self.schedule(*message_id, MessageStatus::Seen);
            scheduled += 1;
        }
        for message_id in undelivered.iter().filter(|id| !unseen.contains(id)) {
            self.schedule(*message_id, MessageStatus::Delivered);
            scheduled += 1;
        }
        if scheduled > 0 {
            info!(scheduled, conversation = ?key, "status: reconciliation pass");
        }
        scheduled
    }
}

#[cfg(test)]
#[path = "tests/status_sync_tests.rs"]
mod tests;
