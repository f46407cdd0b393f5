use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use client_core::{
    config::{ReconnectPolicy, SendPolicy},
    ClientConfig, ClientEvent, ConversationKey, MessagingError, MessagingSession, SendTarget,
    SessionIdentity,
};
use shared::{
    domain::{ConnectionState, ConversationId, MessageId, MessageStatus, UserId},
    protocol::{ConversationSummary, InboundFrame, MessagePayload, OutboundFrame},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};

const SELF: UserId = UserId(1);
const PEER: UserId = UserId(42);
const CONVERSATION: ConversationId = ConversationId(7);

#[derive(Debug, Clone)]
enum Control {
    Push(String),
    Drop,
}

struct ServerInner {
    accepting: AtomicBool,
    next_message_id: AtomicI64,
    connections: AtomicUsize,
    control: broadcast::Sender<Control>,
    marks: Mutex<Vec<(i64, String)>>,
    received: Mutex<Vec<OutboundFrame>>,
}

#[derive(Clone)]
struct FakeServer {
    inner: Arc<ServerInner>,
}

impl FakeServer {
    fn push(&self, frame: &InboundFrame) {
        let text = serde_json::to_string(frame).expect("encode frame");
        let _ = self.inner.control.send(Control::Push(text));
    }

    fn drop_connections(&self) {
        let _ = self.inner.control.send(Control::Drop);
    }

    async fn marks(&self) -> Vec<(i64, String)> {
        self.inner.marks.lock().await.clone()
    }

    async fn received(&self) -> Vec<OutboundFrame> {
        self.inner.received.lock().await.clone()
    }
}

fn payload(id: i64, sender: UserId, receiver: UserId, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: CONVERSATION,
        sender_id: sender,
        receiver_id: receiver,
        content: content.to_string(),
        created_at: Utc::now(),
        status: None,
        temp_id: None,
        delivered: false,
        seen: false,
        read: false,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<FakeServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if query.get("token").map(String::as_str) != Some("good") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !server.inner.accepting.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(server, socket))
        .into_response()
}

async fn serve_socket(server: FakeServer, mut socket: WebSocket) {
    let mut control = server.inner.control.subscribe();
    server.inner.connections.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            command = control.recv() => match command {
                Ok(Control::Push(text)) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Ok(Control::Drop) | Err(_) => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<OutboundFrame>(&text) else {
                        continue;
                    };
                    server.inner.received.lock().await.push(frame.clone());
                    let id = server.inner.next_message_id.fetch_add(1, Ordering::SeqCst);
                    let mut message = payload(id, SELF, frame.receiver_id, &frame.content);
                    message.conversation_id = frame.conversation_id.unwrap_or(CONVERSATION);
                    message.temp_id = Some(frame.temp_id);
                    let echo = serde_json::to_string(&InboundFrame::Message { message })
                        .expect("encode echo");
                    if socket.send(WsMessage::Text(echo)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}

async fn list_conversations() -> Json<Vec<ConversationSummary>> {
    Json(Vec::new())
}

async fn start_conversation(Json(body): Json<serde_json::Value>) -> Json<ConversationSummary> {
    let peer = body["user2_id"].as_i64().unwrap_or_default();
    Json(ConversationSummary {
        id: CONVERSATION,
        user1_id: SELF,
        user2_id: UserId(peer),
        last_message_timestamp: None,
        other_user: None,
        last_message_content: None,
    })
}

async fn mark(State(server): State<FakeServer>, Path((id, status)): Path<(i64, String)>) {
    server.inner.marks.lock().await.push((id, status));
}

async fn history() -> Json<Vec<MessagePayload>> {
    Json(Vec::new())
}

async fn spawn_server() -> anyhow::Result<(String, FakeServer)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (control, _) = broadcast::channel(32);
    let server = FakeServer {
        inner: Arc::new(ServerInner {
            accepting: AtomicBool::new(true),
            next_message_id: AtomicI64::new(101),
            connections: AtomicUsize::new(0),
            control,
            marks: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }),
    };
    let app = Router::new()
        .route("/messages/ws", get(ws_handler))
        .route(
            "/conversations/",
            get(list_conversations).post(start_conversation),
        )
        .route("/conversations/:id/messages/", get(history))
        .route("/messages/:id/:status/", put(mark))
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), server))
}

fn config(server_url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(server_url);
    config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        jitter: 0.0,
    };
    config.send = SendPolicy {
        ack_timeout: Duration::from_secs(2),
        outbox_tick: Duration::from_millis(20),
        ..SendPolicy::default()
    };
    config
}

async fn start_session(server_url: &str, token: &str) -> client_core::Result<Arc<MessagingSession>> {
    let session = MessagingSession::new(
        config(server_url),
        SessionIdentity {
            user_id: SELF,
            token: token.into(),
        },
    )?;
    session.start().await?;
    Ok(session)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn first_message_to_new_peer_is_reconciled_once() {
    let (server_url, _server) = spawn_server().await.expect("spawn server");
    let session = start_session(&server_url, "good").await.expect("start");

    let receipt = session
        .send(SendTarget::Peer(PEER), "hello")
        .await
        .expect("send");
    let confirmed = ConversationKey::Confirmed(CONVERSATION);
    assert_eq!(receipt.conversation, confirmed);

    eventually("echo reconciliation", || {
        let session = Arc::clone(&session);
        async move {
            session
                .messages(confirmed)
                .await
                .iter()
                .any(|m| m.message_id == Some(MessageId(101)))
        }
    })
    .await;

    let messages = session.messages(confirmed).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].content, "hello");
    let conversations = session.conversations().await;
    assert_eq!(conversations[0].key, confirmed);
    assert_eq!(conversations[0].peer_id, PEER);
    session.shutdown().await;
}

#[tokio::test]
async fn send_while_reconnecting_is_delivered_after_reconnect() {
    let (server_url, server) = spawn_server().await.expect("spawn server");
    let session = start_session(&server_url, "good").await.expect("start");
    let mut events = session.subscribe();

    server.inner.accepting.store(false, Ordering::SeqCst);
    server.drop_connections();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::ConnectionStateChanged(ConnectionState::Reconnecting)) =
                events.recv().await
            {
                break;
            }
        }
    })
    .await
    .expect("reconnecting");

    let receipt = session
        .send(SendTarget::Peer(PEER), "are you there?")
        .await
        .expect("send");
    let pending = session.messages(receipt.conversation).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MessageStatus::Pending);
    assert!(server.received().await.is_empty());

    server.inner.accepting.store(true, Ordering::SeqCst);
    eventually("queued frame reconciled", || {
        let session = Arc::clone(&session);
        async move {
            session
                .messages(receipt.conversation)
                .await
                .iter()
                .any(|m| m.status == MessageStatus::Sent)
        }
    })
    .await;

    assert_eq!(session.messages(receipt.conversation).await.len(), 1);
    assert_eq!(server.received().await.len(), 1);
    assert_eq!(session.connection_state(), ConnectionState::Connected);
    session.shutdown().await;
}

#[tokio::test]
async fn inbound_message_gets_one_call_per_transition() {
    let (server_url, server) = spawn_server().await.expect("spawn server");
    let session = start_session(&server_url, "good").await.expect("start");
    eventually("socket registered", || {
        let server = server.clone();
        async move { server.inner.connections.load(Ordering::SeqCst) == 1 }
    })
    .await;

    server.push(&InboundFrame::Message {
        message: payload(201, PEER, SELF, "hi there"),
    });
    eventually("inbound message stored", || {
        let session = Arc::clone(&session);
        async move {
            !session
                .messages(ConversationKey::Confirmed(CONVERSATION))
                .await
                .is_empty()
        }
    })
    .await;

    let delivered = session.mark_delivered(MessageId(201));
    let seen = session.mark_seen(MessageId(201));
    delivered.await.expect("delivered task");
    seen.await.expect("seen task");

    eventually("seen applied", || {
        let session = Arc::clone(&session);
        async move {
            session
                .messages(ConversationKey::Confirmed(CONVERSATION))
                .await
                .first()
                .is_some_and(|m| m.status == MessageStatus::Seen)
        }
    })
    .await;
    assert_eq!(
        server.marks().await,
        vec![(201, "delivered".to_string()), (201, "seen".to_string())]
    );
    session.shutdown().await;
}

#[tokio::test]
async fn out_of_order_status_frames_never_regress() {
    let (server_url, server) = spawn_server().await.expect("spawn server");
    let session = start_session(&server_url, "good").await.expect("start");
    eventually("socket registered", || {
        let server = server.clone();
        async move { server.inner.connections.load(Ordering::SeqCst) == 1 }
    })
    .await;

    server.push(&InboundFrame::Message {
        message: payload(101, SELF, PEER, "ping"),
    });
    server.push(&InboundFrame::Status {
        message_id: MessageId(101),
        status: MessageStatus::Seen,
    });
    server.push(&InboundFrame::Status {
        message_id: MessageId(101),
        status: MessageStatus::Delivered,
    });
    server.push(&InboundFrame::Message {
        message: payload(102, SELF, PEER, "sentinel"),
    });

    eventually("sentinel applied", || {
        let session = Arc::clone(&session);
        async move {
            session
                .messages(ConversationKey::Confirmed(CONVERSATION))
                .await
                .iter()
                .any(|m| m.message_id == Some(MessageId(102)))
        }
    })
    .await;
    let status = session
        .messages(ConversationKey::Confirmed(CONVERSATION))
        .await
        .into_iter()
        .find(|m| m.message_id == Some(MessageId(101)))
        .map(|m| m.status);
    assert_eq!(status, Some(MessageStatus::Seen));
    session.shutdown().await;
}

#[tokio::test]
async fn rejected_credential_is_terminal() {
    let (server_url, server) = spawn_server().await.expect("spawn server");
    let session = MessagingSession::new(
        config(&server_url),
        SessionIdentity {
            user_id: SELF,
            token: "expired".into(),
        },
    )
    .expect("session");
    let mut events = session.subscribe();

    let err = session.start().await.expect_err("rejected");

    assert!(matches!(err, MessagingError::Authentication(_)));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= matches!(event, ClientEvent::AuthenticationFailed(_));
    }
    assert!(saw_failure);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.inner.connections.load(Ordering::SeqCst), 0);
    session.shutdown().await;
}
