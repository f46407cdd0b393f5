use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    error::ApiError,
    protocol::{
        ConversationSummary, HistoryPage, MessagePayload, SearchQuery, SendMessageRequest,
        StartConversationRequest,
    },
};

/// REST calls the messaging core consumes. Every call must be safe to repeat
/// with the same arguments.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
    async fn fetch_history(
        &self,
        conversation_id: ConversationId,
        page: HistoryPage,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload>;
    async fn start_conversation(&self, peer_id: UserId) -> Result<ConversationSummary>;
    async fn mark_status(&self, message_id: MessageId, status: MessageStatus) -> Result<()>;
    async fn search_messages(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> Result<Vec<MessagePayload>>;
}

pub struct HttpMessagingApi {
    http: Client,
    server_url: String,
    token: String,
}

impl HttpMessagingApi {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url, token)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn checked(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_http_status(status.as_u16(), body).into())
    }
}

fn status_path(status: MessageStatus) -> Result<&'static str> {
    match status {
        MessageStatus::Delivered => Ok("delivered"),
        MessageStatus::Seen => Ok("seen"),
        MessageStatus::Read => Ok("read"),
        other => Err(anyhow::anyhow!(
            "status {other} cannot be reported by the receiver"
        )),
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let response = self
            .authorized(self.http.get(self.url("/conversations/")))
            .send()
            .await
            .context("failed to list conversations")?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn fetch_history(
        &self,
        conversation_id: ConversationId,
        page: HistoryPage,
    ) -> Result<Vec<MessagePayload>> {
        let limit = page.limit.clamp(1, HistoryPage::MAX_LIMIT);
        let response = self
            .authorized(self.http.get(self.url(&format!(
                "/conversations/{}/messages/",
                conversation_id.0
            ))))
            .query(&[("skip", page.skip), ("limit", limit)])
            .send()
            .await
            .with_context(|| format!("failed to fetch history for conversation {conversation_id}"))?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        let response = self
            .authorized(self.http.post(self.url("/messages/")))
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to post message {}", request.temp_id))?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn start_conversation(&self, peer_id: UserId) -> Result<ConversationSummary> {
        let response = self
            .authorized(self.http.post(self.url("/conversations/")))
            .json(&StartConversationRequest { user2_id: peer_id })
            .send()
            .await
            .with_context(|| format!("failed to start conversation with user {peer_id}"))?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn mark_status(&self, message_id: MessageId, status: MessageStatus) -> Result<()> {
        let path = status_path(status)?;
        let response = self
            .authorized(
                self.http
                    .put(self.url(&format!("/messages/{}/{path}/", message_id.0))),
            )
            .send()
            .await
            .with_context(|| format!("failed to mark message {message_id} {path}"))?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn search_messages(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> Result<Vec<MessagePayload>> {
        let response = self
            .authorized(self.http.get(self.url(&format!(
                "/conversations/{}/messages/search/",
                conversation_id.0
            ))))
            .query(&SearchQuery {
                query: query.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("failed to search conversation {conversation_id}"))?;
        Ok(Self::checked(response).await?.json().await?)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
