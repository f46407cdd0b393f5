use std::{collections::HashMap, fs};

use client_core::{ClientConfig, DeliveryRoute, ReadPolicy};

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    pub token: Option<String>,
    pub user_id: Option<i64>,
    pub read_policy: ReadPolicy,
    pub route: DeliveryRoute,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            token: None,
            user_id: None,
            read_policy: ReadPolicy::default(),
            route: DeliveryRoute::Socket,
        }
    }
}

impl Settings {
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.server_url.clone());
        config.read_policy = self.read_policy;
        config.send.route = self.route;
        config
    }
}

pub fn load_settings() -> Settings {
    let raw = fs::read_to_string(SETTINGS_FILE).ok();
    load_settings_from(raw.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then flat keys from the settings file, then the environment.
pub fn load_settings_from(raw_file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = raw_file {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) {
            if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
                settings.server_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("token").and_then(toml::Value::as_str) {
                settings.token = Some(v.to_string());
            }
            if let Some(v) = file_cfg.get("user_id").and_then(toml::Value::as_integer) {
                settings.user_id = Some(v);
            }
            if let Some(v) = file_cfg.get("read_policy").and_then(read_policy_value) {
                settings.read_policy = v;
            }
            if let Some(v) = file_cfg
                .get("route")
                .and_then(toml::Value::as_str)
                .and_then(parse_route)
            {
                settings.route = v;
            }
        }
    }

    if let Some(v) = env("MESSAGING_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = env("MESSAGING_TOKEN") {
        settings.token = Some(v);
    }
    if let Some(v) = env("APP__TOKEN") {
        settings.token = Some(v);
    }

    if let Some(v) = env("APP__USER_ID") {
        if let Ok(parsed) = v.trim().parse::<i64>() {
            settings.user_id = Some(parsed);
        }
    }

    if let Some(v) = env("APP__READ_POLICY").and_then(|v| ReadPolicy::parse(&v)) {
        settings.read_policy = v;
    }
    if let Some(v) = env("APP__ROUTE").and_then(|v| parse_route(&v)) {
        settings.route = v;
    }

    settings
}

pub fn parse_route(raw: &str) -> Option<DeliveryRoute> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "socket" | "ws" => Some(DeliveryRoute::Socket),
        "rest" | "http" => Some(DeliveryRoute::Rest),
        _ => None,
    }
}

fn read_policy_value(value: &toml::Value) -> Option<ReadPolicy> {
    match value {
        toml::Value::String(raw) => ReadPolicy::parse(raw),
        toml::Value::Integer(ms) => ReadPolicy::parse(&ms.to_string()),
        _ => None,
    }
}
