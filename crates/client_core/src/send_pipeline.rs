use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{ConnectionState, ConversationId, TempId, UserId},
    protocol::{MessagePayload, OutboundFrame, SendMessageRequest},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    api::MessagingApi,
    config::{DeliveryRoute, SendPolicy, MAX_CONTENT_CHARS},
    directory::{ConversationDirectory, TouchTarget},
    error::{MessagingError, Result},
    message_log::MessageLogStore,
    transport::ConnectionManager,
    types::{ConversationKey, Message},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Peer(UserId),
    Conversation(ConversationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub temp_id: TempId,
    pub conversation: ConversationKey,
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    temp_id: TempId,
    conversation: ConversationKey,
    receiver_id: UserId,
    content: String,
    attempts: u32,
    last_attempt: Option<Instant>,
    /// Connection epoch of the last socket transmission.
    epoch: u64,
    queued_at: Instant,
}

impl OutboxEntry {
    fn frame(&self) -> OutboundFrame {
        OutboundFrame {
            receiver_id: self.receiver_id,
            content: self.content.clone(),
            conversation_id: self.conversation.conversation_id(),
            temp_id: self.temp_id.clone(),
        }
    }
}

enum SweepAction {
    Transmit(OutboxEntry),
    Fail(OutboxEntry, MessagingError),
}

struct Inner {
    api: Arc<dyn MessagingApi>,
    transport: ConnectionManager,
    log: MessageLogStore,
    directory: ConversationDirectory,
    self_id: UserId,
    policy: SendPolicy,
    events: broadcast::Sender<ClientEvent>,
    outbox: Mutex<Vec<OutboxEntry>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SendPipeline {
    inner: Arc<Inner>,
}

pub fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(MessagingError::InvalidContent(
            "message content is empty".into(),
        ));
    }
    let length = content.chars().count();
    if length > MAX_CONTENT_CHARS {
        return Err(MessagingError::InvalidContent(format!(
            "message content is {length} characters; the limit is {MAX_CONTENT_CHARS}"
        )));
    }
    Ok(())
}

impl SendPipeline {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        transport: ConnectionManager,
        log: MessageLogStore,
        directory: ConversationDirectory,
        self_id: UserId,
        policy: SendPolicy,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                transport,
                log,
                directory,
                self_id,
                policy,
                events,
                outbox: Mutex::new(Vec::new()),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Starts the outbox watcher. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut watcher = self.inner.watcher.lock().await;
        if watcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let pipeline = self.clone();
        let state_rx = self.inner.transport.watch_state();
        *watcher = Some(tokio::spawn(async move {
            pipeline.watch_outbox(state_rx).await;
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.inner.watcher.lock().await.take() {
            task.abort();
        }
    }

    async fn watch_outbox(&self, mut state_rx: watch::Receiver<ConnectionState>) {
        let mut tick = tokio::time::interval(self.inner.policy.outbox_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *state_rx.borrow_and_update() == ConnectionState::Connected {
                        debug!(
                            epoch = self.inner.transport.epoch(),
                            "send: connection up; re-driving outbox"
                        );
                    }
                }
            }
            self.sweep().await;
        }
    }

    /// Records `content` as a pending message and hands it to the wire.
    pub async fn send(&self, target: SendTarget, content: &str) -> Result<SendReceipt> {
        validate_content(content)?;
        let inner = &self.inner;

        let (mut conversation, receiver_id) = match target {
            SendTarget::Conversation(conversation_id) => {
                let key = ConversationKey::Confirmed(conversation_id);
                let entry = inner
                    .directory
                    .get(key)
                    .await
                    .ok_or(MessagingError::UnknownConversation(conversation_id))?;
                (key, entry.peer_id)
            }
            SendTarget::Peer(peer_id) => (inner.directory.ensure_peer(peer_id, None).await, peer_id),
        };

        let temp_id = TempId::generate();
        let now = Utc::now();
        let pending = Message::pending(
            conversation,
            temp_id.clone(),
            inner.self_id,
            receiver_id,
            content,
            now,
        );
        inner.log.append(conversation, pending.clone()).await;
        let _ = inner.events.send(ClientEvent::MessageUpserted {
            conversation,
            message: pending,
        });

        let touch = match conversation {
            ConversationKey::Confirmed(conversation_id) => TouchTarget::Conversation(conversation_id),
            ConversationKey::Provisional(peer_id) => TouchTarget::Peer(peer_id),
        };
        inner.directory.touch(touch, content, now).await?;
        let _ = inner.events.send(ClientEvent::ConversationsUpdated);
        info!(
            temp_id = %temp_id,
            conversation = %conversation,
            receiver_id = receiver_id.0,
            "send: message queued"
        );

        if conversation.is_provisional() {
            conversation = self.ensure_conversation(receiver_id).await;
        }

        let queued_at = Instant::now();
        inner.outbox.lock().await.push(OutboxEntry {
            temp_id: temp_id.clone(),
            conversation,
            receiver_id,
            content: content.to_string(),
            attempts: 0,
            last_attempt: None,
            epoch: 0,
            queued_at,
        });
        self.sweep().await;

        Ok(SendReceipt {
            temp_id,
            conversation,
        })
    }

    async fn ensure_conversation(&self, peer_id: UserId) -> ConversationKey {
        match self.inner.api.start_conversation(peer_id).await {
            Ok(summary) => {
                let display_name = summary.peer_display_name();
                self.confirm_conversation(peer_id, summary.id, display_name)
                    .await
            }
            Err(err) => {
                warn!(
                    peer_id = peer_id.0,
                    error = %format!("{err:#}"),
                    "send: start conversation failed; sending without conversation id"
                );
                ConversationKey::Provisional(peer_id)
            }
        }
    }

    pub async fn confirm_conversation(
        &self,
        peer_id: UserId,
        conversation_id: ConversationId,
        display_name: Option<String>,
    ) -> ConversationKey {
        let confirmed = ConversationKey::Confirmed(conversation_id);
        let placeholder = self
            .inner
            .directory
            .confirm(peer_id, conversation_id, display_name)
            .await;
        if let Some(placeholder) = placeholder {
            self.adopt_conversation(placeholder, confirmed).await;
            let _ = self.inner.events.send(ClientEvent::ConversationsUpdated);
        }
        confirmed
    }

    pub async fn adopt_conversation(&self, placeholder: ConversationKey, confirmed: ConversationKey) {
        let moved = self.inner.log.rekey(placeholder, confirmed).await;
        let mut outbox = self.inner.outbox.lock().await;
        for entry in outbox.iter_mut().filter(|e| e.conversation == placeholder) {
            entry.conversation = confirmed;
        }
        info!(
            placeholder = %placeholder,
            conversation = %confirmed,
            moved,
            "send: placeholder conversation confirmed"
        );
    }

    pub async fn acknowledge(&self, temp_id: &TempId) -> bool {
        let mut outbox = self.inner.outbox.lock().await;
        let before = outbox.len();
        outbox.retain(|entry| &entry.temp_id != temp_id);
        let removed = outbox.len() != before;
        if removed {
            debug!(temp_id = %temp_id, "send: acknowledged");
        }
        removed
    }

    pub async fn retry(&self, temp_id: &TempId) -> Result<()> {
        if !self.inner.log.mark_pending(temp_id).await {
            return Err(MessagingError::UnknownMessage(temp_id.to_string()));
        }
        let message = self
            .inner
            .log
            .find_by_temp(temp_id)
            .await
            .ok_or_else(|| MessagingError::UnknownMessage(temp_id.to_string()))?;
        let _ = self.inner.events.send(ClientEvent::MessageUpserted {
            conversation: message.conversation,
            message: message.clone(),
        });
        info!(temp_id = %temp_id, "send: retry requested");
        self.inner.outbox.lock().await.push(OutboxEntry {
            temp_id: temp_id.clone(),
            conversation: message.conversation,
            receiver_id: message.receiver_id,
            content: message.content,
            attempts: 0,
            last_attempt: None,
            epoch: 0,
            queued_at: Instant::now(),
        });
        self.sweep().await;
        Ok(())
    }

    pub async fn discard(&self, temp_id: &TempId) -> Result<Message> {
        let removed = self
            .inner
            .log
            .discard(temp_id)
            .await
            .ok_or_else(|| MessagingError::UnknownMessage(temp_id.to_string()))?;
        self.acknowledge(temp_id).await;
        info!(temp_id = %temp_id, conversation = %removed.conversation, "send: discarded");
        let _ = self.inner.events.send(ClientEvent::MessageDiscarded {
            conversation: removed.conversation,
            temp_id: temp_id.clone(),
        });
        Ok(removed)
    }

    pub async fn queued(&self) -> Vec<TempId> {
        self.inner
            .outbox
            .lock()
            .await
            .iter()
            .map(|entry| entry.temp_id.clone())
            .collect()
    }

    pub async fn sweep(&self) {
        let inner = &self.inner;
        let state = inner.transport.state();
        let epoch = inner.transport.epoch();
        let policy = &inner.policy;
        let now = Instant::now();

        let queued: Vec<TempId> = inner
            .outbox
            .lock()
            .await
            .iter()
            .map(|entry| entry.temp_id.clone())
            .collect();
        for temp_id in &queued {
            let reconciled = inner
                .log
                .find_by_temp(temp_id)
                .await
                .map_or(true, |message| !message.is_provisional());
            if reconciled {
                self.acknowledge(temp_id).await;
            }
        }

        let mut actions = Vec::new();
        {
            let mut outbox = inner.outbox.lock().await;
            let mut index = 0;
            while index < outbox.len() {
                let entry = &mut outbox[index];
                let awaiting_ack = entry
                    .last_attempt
                    .is_some_and(|at| now.duration_since(at) < policy.ack_timeout);
                let lost_with_connection = policy.route == DeliveryRoute::Socket
                    && entry.attempts > 0
                    && entry.epoch != epoch
                    && state == ConnectionState::Connected;

                if awaiting_ack && !lost_with_connection {
                    index += 1;
                    continue;
                }
                if entry.attempts >= policy.max_attempts.max(1) {
                    let attempts = entry.attempts;
                    let entry = outbox.remove(index);
                    let temp_id = entry.temp_id.clone();
                    actions.push(SweepAction::Fail(
                        entry,
                        MessagingError::SendTimeout { temp_id, attempts },
                    ));
                    continue;
                }
                if policy.route == DeliveryRoute::Socket && state != ConnectionState::Connected {
                    let waiting_since = entry.last_attempt.unwrap_or(entry.queued_at);
                    if now.duration_since(waiting_since) >= policy.offline_grace {
                        let entry = outbox.remove(index);
                        actions.push(SweepAction::Fail(entry, MessagingError::NotConnected));
                        continue;
                    }
                    index += 1;
                    continue;
                }

                entry.attempts += 1;
                entry.last_attempt = Some(now);
                entry.epoch = epoch;
                actions.push(SweepAction::Transmit(entry.clone()));
                index += 1;
            }
        }

        for action in actions {
            match action {
                SweepAction::Transmit(entry) => self.transmit(entry).await,
                SweepAction::Fail(entry, reason) => self.fail(entry, reason).await,
            }
        }
    }

    async fn transmit(&self, entry: OutboxEntry) {
        debug!(
            temp_id = %entry.temp_id,
            attempt = entry.attempts,
            route = ?self.inner.policy.route,
            "send: transmitting"
        );
        match self.inner.policy.route {
            DeliveryRoute::Socket => {
                if let Err(err) = self.inner.transport.send(&entry.frame()).await {
                    debug!(temp_id = %entry.temp_id, error = %err, "send: frame not written");
                    self.undo_attempt(&entry.temp_id).await;
                }
            }
            DeliveryRoute::Rest => {
                let request = SendMessageRequest::from(&entry.frame());
                let response = tokio::time::timeout(
                    self.inner.policy.ack_timeout,
                    self.inner.api.send_message(&request),
                )
                .await;
                match response {
                    Ok(Ok(payload)) => self.accept_rest_ack(&entry, payload).await,
                    Ok(Err(err)) => warn!(
                        temp_id = %entry.temp_id,
                        attempt = entry.attempts,
                        error = %format!("{err:#}"),
                        "send: rest delivery failed"
                    ),
                    Err(_) => warn!(
                        temp_id = %entry.temp_id,
                        attempt = entry.attempts,
                        "send: rest delivery timed out"
                    ),
                }
            }
        }
    }

    async fn undo_attempt(&self, temp_id: &TempId) {
        let mut outbox = self.inner.outbox.lock().await;
        if let Some(entry) = outbox.iter_mut().find(|e| &e.temp_id == temp_id) {
            entry.attempts = entry.attempts.saturating_sub(1);
            entry.last_attempt = None;
        }
    }

    async fn accept_rest_ack(&self, entry: &OutboxEntry, mut payload: MessagePayload) {
        // The response is ours even when the server does not echo the temp id.
        if payload.temp_id.is_none() {
            payload.temp_id = Some(entry.temp_id.clone());
        }
        let peer_id = payload.peer_of(self.inner.self_id);
        let conversation = self
            .confirm_conversation(peer_id, payload.conversation_id, None)
            .await;
        let message = Message::from_payload(&payload);
        let outcome = self.inner.log.append(conversation, message.clone()).await;
        if let Err(err) = self
            .inner
            .directory
            .touch(
                TouchTarget::Confirmed {
                    conversation_id: payload.conversation_id,
                    peer_id,
                },
                payload.content.clone(),
                payload.created_at,
            )
            .await
        {
            debug!(error = %err, "send: directory touch after rest ack failed");
        }
        if outcome.changed() {
            let _ = self.inner.events.send(ClientEvent::MessageUpserted {
                conversation,
                message,
            });
            let _ = self.inner.events.send(ClientEvent::ConversationsUpdated);
        }
        self.acknowledge(&entry.temp_id).await;
    }

    async fn fail(&self, entry: OutboxEntry, reason: MessagingError) {
        warn!(
            temp_id = %entry.temp_id,
            conversation = %entry.conversation,
            attempts = entry.attempts,
            reason = %reason,
            "send: giving up; message marked failed"
        );
        if !self.inner.log.mark_failed(&entry.temp_id).await {
            return;
        }
        if let Some(message) = self.inner.log.find_by_temp(&entry.temp_id).await {
            let _ = self.inner.events.send(ClientEvent::MessageUpserted {
                conversation: message.conversation,
                message,
            });
        }
        let _ = self.inner.events.send(ClientEvent::SendFailed {
            temp_id: entry.temp_id,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
#[path = "tests/send_pipeline_tests.rs"]
mod tests;
