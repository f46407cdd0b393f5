use std::sync::Arc;

use futures::Stream;
use shared::{
    domain::{ConnectionState, ConversationId, MessageId, MessageStatus, TempId, UserId},
    protocol::{HistoryPage, MessagePayload},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    api::{HttpMessagingApi, MessagingApi},
    config::ClientConfig,
    directory::{ConversationDirectory, TouchTarget},
    error::{MessagingError, Result},
    message_log::{AppendOutcome, HistoryMerge, MessageLogStore},
    send_pipeline::{SendPipeline, SendReceipt, SendTarget},
    status_sync::{PromotionOutcome, StatusSynchronizer},
    transport::{ConnectionManager, TransportEvent},
    types::{ConversationEntry, ConversationKey, Message},
    ClientEvent,
};

/// Who the session acts as. Supplied by the caller; never refreshed here.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub token: String,
}

pub struct MessagingSession {
    config: ClientConfig,
    identity: SessionIdentity,
    api: Arc<dyn MessagingApi>,
    transport: ConnectionManager,
    directory: ConversationDirectory,
    log: MessageLogStore,
    status: StatusSynchronizer,
    pipeline: SendPipeline,
    events: broadcast::Sender<ClientEvent>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl MessagingSession {
    pub fn new(config: ClientConfig, identity: SessionIdentity) -> Result<Arc<Self>> {
        let api = HttpMessagingApi::new(config.rest_base(), identity.token.clone());
        Self::with_api(config, identity, Arc::new(api))
    }

    pub fn with_api(
        config: ClientConfig,
        identity: SessionIdentity,
        api: Arc<dyn MessagingApi>,
    ) -> Result<Arc<Self>> {
        let transport = ConnectionManager::from_config(&config)?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let directory = ConversationDirectory::new();
        let log = MessageLogStore::new();
        let status = StatusSynchronizer::new(
            Arc::clone(&api),
            log.clone(),
            identity.user_id,
            config.status.clone(),
            config.read_policy,
            events.clone(),
        );
        let pipeline = SendPipeline::new(
            Arc::clone(&api),
            transport.clone(),
            log.clone(),
            directory.clone(),
            identity.user_id,
            config.send.clone(),
            events.clone(),
        );
        Ok(Arc::new(Self {
            config,
            identity,
            api,
            transport,
            directory,
            log,
            status,
            pipeline,
            events,
            dispatch: Mutex::new(None),
        }))
    }

    pub fn self_id(&self) -> UserId {
        self.identity.user_id
    }

    /// Starts the dispatch loop and the outbox watcher, then connects.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_dispatch().await;
        self.pipeline.start().await;
        if let Err(err) = self.transport.connect(&self.identity.token).await {
            if let MessagingError::Authentication(reason) = &err {
                let _ = self
                    .events
                    .send(ClientEvent::AuthenticationFailed(reason.clone()));
            }
            if err.is_terminal() {
                self.pipeline.stop().await;
            }
            return Err(err);
        }
        info!(user_id = self.identity.user_id.0, "session: started");
        Ok(())
    }

    async fn spawn_dispatch(self: &Arc<Self>) {
        let mut dispatch = self.dispatch.lock().await;
        if dispatch.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let rx = self.transport.subscribe();
        let session = Arc::clone(self);
        *dispatch = Some(tokio::spawn(async move {
            session.dispatch_loop(rx).await;
        }));
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: broadcast::Receiver<TransportEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.handle_transport_event(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session: dispatch fell behind; reconciling statuses");
                    self.status.reconcile_pass(None).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("session: dispatch loop stopped");
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessageCreated(payload) => {
                if let Err(err) = self.apply_payload(payload).await {
                    warn!(error = %err, "session: failed to apply pushed message");
                    let _ = self.events.send(ClientEvent::Error(err.to_string()));
                }
            }
            TransportEvent::StatusUpdated { message_id, status } => {
                self.apply_remote_status(message_id, status).await;
            }
            TransportEvent::ConnectionStateChanged(state) => {
                let _ = self.events.send(ClientEvent::ConnectionStateChanged(state));
                if state == ConnectionState::Connected {
                    self.status.reconcile_pass(None).await;
                }
            }
            TransportEvent::AuthenticationRejected(reason) => {
                let _ = self.events.send(ClientEvent::AuthenticationFailed(reason));
            }
        }
    }

    async fn apply_payload(&self, payload: MessagePayload) -> Result<AppendOutcome> {
        let self_id = self.identity.user_id;
        let peer_id = payload.peer_of(self_id);
        let touch = self
            .directory
            .touch(
                TouchTarget::Confirmed {
                    conversation_id: payload.conversation_id,
                    peer_id,
                },
                payload.content.clone(),
                payload.created_at,
            )
            .await?;
        if let Some(placeholder) = touch.replaced_placeholder {
            self.pipeline.adopt_conversation(placeholder, touch.key).await;
        }

        let message = Message::from_payload(&payload);
        let inbound = message.is_inbound_for(self_id);
        let outcome = self.log.append(touch.key, message).await;
        if let AppendOutcome::Reconciled { temp_id } = &outcome {
            self.pipeline.acknowledge(temp_id).await;
        }
        if outcome.changed() {
            if let Some(stored) = self.log.get(payload.message_id).await {
                let _ = self.events.send(ClientEvent::MessageUpserted {
                    conversation: touch.key,
                    message: stored,
                });
            }
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);

        if inbound {
            self.status
                .schedule(payload.message_id, MessageStatus::Delivered);
        }
        Ok(outcome)
    }

    async fn apply_remote_status(&self, message_id: MessageId, status: MessageStatus) {
        if !self.log.update_status(message_id, status).await {
            return;
        }
        if let Some(message) = self.log.get(message_id).await {
            let _ = self.events.send(ClientEvent::MessageStatusChanged {
                conversation: message.conversation,
                message_id,
                status,
            });
        }
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<ConversationEntry>> {
        let summaries = self.api.list_conversations().await?;
        let confirmed = self
            .directory
            .merge_listing(self.identity.user_id, &summaries)
            .await;
        for placeholder in confirmed {
            self.pipeline
                .adopt_conversation(
                    placeholder.placeholder,
                    ConversationKey::Confirmed(placeholder.conversation_id),
                )
                .await;
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        Ok(self.directory.list().await)
    }

    pub async fn load_latest(&self, conversation_id: ConversationId) -> Result<HistoryMerge> {
        self.load_history(
            conversation_id,
            HistoryPage::first(self.config.history_page_size),
        )
        .await
    }

    pub async fn load_history(
        &self,
        conversation_id: ConversationId,
        page: HistoryPage,
    ) -> Result<HistoryMerge> {
        let payloads = self.api.fetch_history(conversation_id, page).await?;
        let key = ConversationKey::Confirmed(conversation_id);
        let merge = self.merge_payloads(conversation_id, &payloads).await?;
        info!(
            conversation_id = conversation_id.0,
            skip = page.skip,
            fetched = payloads.len(),
            inserted = merge.inserted,
            reconciled = merge.reconciled,
            "session: history merged"
        );
        let _ = self.events.send(ClientEvent::HistoryMerged {
            conversation: key,
            merge,
        });
        self.status.reconcile_pass(Some(key)).await;
        Ok(merge)
    }

    async fn merge_payloads(
        &self,
        conversation_id: ConversationId,
        payloads: &[MessagePayload],
    ) -> Result<HistoryMerge> {
        let key = ConversationKey::Confirmed(conversation_id);
        if let Some(latest) = payloads.iter().max_by_key(|p| (p.created_at, p.message_id)) {
            let touch = self
                .directory
                .touch(
                    TouchTarget::Confirmed {
                        conversation_id,
                        peer_id: latest.peer_of(self.identity.user_id),
                    },
                    latest.content.clone(),
                    latest.created_at,
                )
                .await?;
            if let Some(placeholder) = touch.replaced_placeholder {
                self.pipeline.adopt_conversation(placeholder, key).await;
            }
        }
        let merge = self
            .log
            .load_history(key, payloads.iter().map(Message::from_payload))
            .await;
        if merge.reconciled > 0 {
            // Drops outbox entries whose confirmation arrived with the page.
            self.pipeline.sweep().await;
        }
        Ok(merge)
    }

    /// Server-side search merged into the log; falls back to the local log
    /// when the server cannot be reached.
    pub async fn search(&self, conversation_id: ConversationId, query: &str) -> Result<Vec<Message>> {
        let key = ConversationKey::Confirmed(conversation_id);
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        match self.api.search_messages(conversation_id, query).await {
            Ok(payloads) => {
                self.merge_payloads(conversation_id, &payloads).await?;
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    error = %format!("{err:#}"),
                    "session: remote search failed; using local log"
                );
            }
        }
        Ok(self.log.search(key, query).await)
    }

    pub async fn send(&self, target: SendTarget, content: &str) -> Result<SendReceipt> {
        self.pipeline.send(target, content).await
    }

    pub async fn retry(&self, temp_id: &TempId) -> Result<()> {
        self.pipeline.retry(temp_id).await
    }

    pub async fn discard(&self, temp_id: &TempId) -> Result<Message> {
        self.pipeline.discard(temp_id).await
    }

    pub async fn message_visible(&self, message_id: MessageId) -> JoinHandle<()> {
        self.status.message_visible(message_id).await
    }

    pub async fn message_hidden(&self, message_id: MessageId) {
        self.status.message_hidden(message_id).await
    }

    pub fn mark_delivered(&self, message_id: MessageId) -> JoinHandle<()> {
        self.status.schedule(message_id, MessageStatus::Delivered)
    }

    pub fn mark_seen(&self, message_id: MessageId) -> JoinHandle<()> {
        self.status.schedule(message_id, MessageStatus::Seen)
    }

    pub fn mark_read(&self, message_id: MessageId) -> JoinHandle<()> {
        self.status.schedule(message_id, MessageStatus::Read)
    }

    pub async fn promote(
        &self,
        message_id: MessageId,
        target: MessageStatus,
    ) -> Result<PromotionOutcome> {
        self.status.promote(message_id, target).await
    }

    pub async fn conversations(&self) -> Vec<ConversationEntry> {
        self.directory.list().await
    }

    pub async fn conversation_for_peer(&self, peer_id: UserId) -> Option<ConversationEntry> {
        self.directory.find_by_peer(peer_id).await
    }

    pub async fn messages(&self, conversation: ConversationKey) -> Vec<Message> {
        self.log.messages(conversation).await
    }

    pub async fn pending_sends(&self) -> Vec<TempId> {
        self.pipeline.queued().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> impl Stream<Item = ClientEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    pub async fn shutdown(&self) {
        self.pipeline.stop().await;
        self.transport.disconnect().await;
        if let Some(task) = self.dispatch.lock().await.take() {
            task.abort();
        }
        info!(user_id = self.identity.user_id.0, "session: stopped");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
