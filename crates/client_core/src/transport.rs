use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{
    domain::{ConnectionState, MessageId, MessageStatus},
    protocol::{InboundFrame, MessagePayload, OutboundFrame},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{ClientConfig, ReconnectPolicy},
    error::{MessagingError, Result},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    MessageCreated(MessagePayload),
    StatusUpdated {
        message_id: MessageId,
        status: MessageStatus,
    },
    ConnectionStateChanged(ConnectionState),
    /// The server refused the credential. No further attempts are made.
    AuthenticationRejected(String),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.policy
            .base_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return ceiling;
        }
        let cut = rand::thread_rng().gen_range(0.0..jitter);
        ceiling.mul_f64(1.0 - cut)
    }
}

enum OpenError {
    Rejected(String),
    Network(String),
}

enum PumpExit {
    Shutdown,
    Rejected(String),
    Dropped(String),
}

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    socket_url: Url,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    link: Mutex<Link>,
    epoch: AtomicU64,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            if next == ConnectionState::Connected {
                self.epoch.fetch_add(1, Ordering::SeqCst);
            }
            info!(state = ?next, "transport: connection state changed");
            let _ = self
                .events
                .send(TransportEvent::ConnectionStateChanged(next));
        }
    }

    async fn install_outbound(&self, outbound: mpsc::UnboundedSender<String>) {
        self.link.lock().await.outbound = Some(outbound);
    }

    async fn clear_outbound(&self) {
        self.link.lock().await.outbound = None;
    }

    async fn reject(&self, reason: String) {
        warn!(reason = %reason, "transport: credential rejected; not retrying");
        {
            let mut link = self.link.lock().await;
            link.outbound = None;
            link.shutdown = None;
        }
        self.set_state(ConnectionState::Disconnected);
        let _ = self
            .events
            .send(TransportEvent::AuthenticationRejected(reason));
    }

    fn dispatch_text(&self, text: &str) {
        match InboundFrame::decode(text) {
            Ok(InboundFrame::Message { message }) => {
                debug!(
                    message_id = message.message_id.0,
                    conversation_id = message.conversation_id.0,
                    "transport: message frame received"
                );
                let _ = self.events.send(TransportEvent::MessageCreated(message));
            }
            Ok(InboundFrame::Status { message_id, status }) => {
                let _ = self
                    .events
                    .send(TransportEvent::StatusUpdated { message_id, status });
            }
            Err(err) => {
                warn!(error = %err, frame_len = text.len(), "transport: dropping malformed frame");
            }
        }
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(socket_url: Url, policy: ReconnectPolicy, event_capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                socket_url,
                policy,
                state,
                events,
                link: Mutex::new(Link::default()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(
            config.socket_url()?,
            config.reconnect.clone(),
            config.event_capacity,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Number of times the connection has been established. Frames written
    /// under an older epoch may have been lost with their connection.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Opens the connection with `auth_token`. A rejected credential fails
    /// immediately with [`MessagingError::Authentication`]; any other failure
    /// leaves the manager retrying in the background.
    pub async fn connect(&self, auth_token: &str) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut link = self.shared.link.lock().await;
            let running = link.task.as_ref().is_some_and(|task| !task.is_finished());
            if running || link.shutdown.is_some() {
                debug!("transport: connect ignored; connection already owned");
                return Ok(());
            }
            link.shutdown = Some(shutdown_tx);
        }

        let mut url = self.shared.socket_url.clone();
        url.query_pairs_mut().append_pair("token", auth_token);

        self.shared.set_state(ConnectionState::Connecting);
        let opened = open(&url).await;

        let mut link = self.shared.link.lock().await;
        if *shutdown_rx.borrow() {
            debug!("transport: disconnected during handshake");
            self.shared.set_state(ConnectionState::Disconnected);
            return Ok(());
        }
        let initial = match opened {
            Ok(ws) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                link.outbound = Some(outbound_tx);
                self.shared.set_state(ConnectionState::Connected);
                Some((ws, outbound_rx))
            }
            Err(OpenError::Rejected(reason)) => {
                link.shutdown = None;
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(MessagingError::Authentication(reason));
            }
            Err(OpenError::Network(reason)) => {
                warn!(reason = %reason, "transport: initial connect failed; retrying");
                self.shared.set_state(ConnectionState::Reconnecting);
                None
            }
        };

        let shared = Arc::clone(&self.shared);
        link.task = Some(tokio::spawn(run(shared, url, initial, shutdown_rx)));
        Ok(())
    }

    pub async fn send(&self, frame: &OutboundFrame) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(MessagingError::NotConnected);
        }
        let text = frame
            .encode()
            .map_err(|err| MessagingError::Api(err.into()))?;
        let link = self.shared.link.lock().await;
        let outbound = link.outbound.as_ref().ok_or(MessagingError::NotConnected)?;
        outbound
            .send(text)
            .map_err(|_| MessagingError::NotConnected)?;
        debug!(temp_id = %frame.temp_id, "transport: frame queued");
        Ok(())
    }

    pub async fn disconnect(&self) {
        let task = {
            let mut link = self.shared.link.lock().await;
            if let Some(shutdown) = link.shutdown.take() {
                let _ = shutdown.send(true);
            }
            link.outbound = None;
            link.task.take()
        };
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

async fn open(url: &Url) -> std::result::Result<WsStream, OpenError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(tungstenite::Error::Http(response)))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Err(OpenError::Rejected(format!(
                "handshake rejected with status {}",
                response.status()
            )))
        }
        Ok(Err(err)) => Err(OpenError::Network(err.to_string())),
        Err(_) => Err(OpenError::Network("connect timed out".into())),
    }
}

async fn run(
    shared: Arc<Shared>,
    url: Url,
    mut current: Option<(WsStream, mpsc::UnboundedReceiver<String>)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(shared.policy.clone());
    loop {
        if let Some((ws, outbound_rx)) = current.take() {
            backoff.reset();
            match pump(&shared, ws, outbound_rx, &mut shutdown).await {
                PumpExit::Shutdown => break,
                PumpExit::Rejected(reason) => {
                    shared.reject(reason).await;
                    return;
                }
                PumpExit::Dropped(reason) => {
                    info!(reason = %reason, "transport: connection lost");
                }
            }
            shared.clear_outbound().await;
            if *shutdown.borrow() {
                break;
            }
            shared.set_state(ConnectionState::Reconnecting);
        }

        let delay = backoff.next_delay();
        info!(
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "transport: scheduling reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match open(&url).await {
            Ok(ws) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                shared.install_outbound(outbound_tx).await;
                shared.set_state(ConnectionState::Connected);
                current = Some((ws, outbound_rx));
            }
            Err(OpenError::Rejected(reason)) => {
                shared.reject(reason).await;
                return;
            }
            Err(OpenError::Network(reason)) => {
                warn!(
                    attempt = backoff.attempt(),
                    reason = %reason,
                    "transport: reconnect attempt failed"
                );
            }
        }
    }

    shared.clear_outbound().await;
    shared.set_state(ConnectionState::Disconnected);
}

async fn pump(
    shared: &Shared,
    ws: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    let (mut writer, mut reader) = ws.split();
    let mut exchanged = false;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = writer.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
            }
            frame = outbound_rx.recv() => {
                let Some(text) = frame else {
                    let _ = writer.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    return PumpExit::Dropped(format!("write failed: {err}"));
                }
                exchanged = true;
            }
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    exchanged = true;
                    shared.dispatch_text(&text);
                }
                Some(Ok(Message::Close(frame))) => {
                    // 1008 on a fresh connection is how the server refuses a token.
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Policy && !exchanged => {
                            PumpExit::Rejected(format!("closed by server: {}", frame.reason))
                        }
                        _ => PumpExit::Dropped("closed by server".into()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::Dropped(err.to_string()),
                None => return PumpExit::Dropped("stream ended".into()),
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
