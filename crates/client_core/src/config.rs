use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{MessagingError, Result};

pub const DEFAULT_SOCKET_PATH: &str = "/messages/ws";
pub const MAX_CONTENT_CHARS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub socket_path: String,
    pub reconnect: ReconnectPolicy,
    pub send: SendPolicy,
    pub status: StatusSyncPolicy,
    pub read_policy: ReadPolicy,
    pub history_page_size: u32,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            socket_path: DEFAULT_SOCKET_PATH.into(),
            reconnect: ReconnectPolicy::default(),
            send: SendPolicy::default(),
            status: StatusSyncPolicy::default(),
            read_policy: ReadPolicy::default(),
            history_page_size: 100,
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn rest_base(&self) -> String {
        self.server_url.trim_end_matches('/').to_string()
    }

    pub fn socket_url(&self) -> Result<Url> {
        let base = self.rest_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base
        } else {
            return Err(MessagingError::InvalidUrl(format!(
                "server_url must start with http:// or https://, got {}",
                self.server_url
            )));
        };
        let path = if self.socket_path.starts_with('/') {
            self.socket_path.clone()
        } else {
            format!("/{}", self.socket_path)
        };
        Url::parse(&format!("{ws_base}{path}"))
            .map_err(|err| MessagingError::InvalidUrl(err.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Fraction of each delay that is randomized, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryRoute {
    #[default]
    Socket,
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SendPolicy {
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    pub max_attempts: u32,
    /// How long a pending send may wait for the connection to come back.
    #[serde(with = "millis")]
    pub offline_grace: Duration,
    #[serde(with = "millis")]
    pub outbox_tick: Duration,
    pub route: DeliveryRoute,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            max_attempts: 3,
            offline_grace: Duration::from_secs(120),
            outbox_tick: Duration::from_millis(250),
            route: DeliveryRoute::Socket,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusSyncPolicy {
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
}

impl Default for StatusSyncPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    SameAsSeen,
    Sustained {
        #[serde(with = "millis")]
        after: Duration,
    },
}

impl Default for ReadPolicy {
    fn default() -> Self {
        ReadPolicy::Sustained {
            after: Duration::from_millis(1500),
        }
    }
}

impl ReadPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("same_as_seen") {
            return Some(ReadPolicy::SameAsSeen);
        }
        raw.parse::<u64>().ok().map(|ms| ReadPolicy::Sustained {
            after: Duration::from_millis(ms),
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
