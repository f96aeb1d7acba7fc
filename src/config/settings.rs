use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub websocket: WebSocketSettings,
    pub dispatcher: DispatcherSettings,
    pub logging: LoggingSettings,
}

/// Addresses the node listens on.
///
/// `port` serves the HTTP ingress, `ws_port` the WebSocket listener.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub ws_port: u16,
}

/// Configuration settings for the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Undelivered messages a processor may hold before it is dropped from a topic.
    pub mailbox_capacity: usize,
    /// Requests that may queue in front of the broker loop.
    pub request_capacity: usize,
    /// Topics created when the broker starts.
    pub topics: Vec<String>,
    /// Where topics are persisted between restarts.
    pub store: StoreKind,
    pub sled_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketSettings {
    pub write_wait_ms: u64,
    pub max_message_size: usize,
}

/// Backend of the topic store and of the peer store.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sled,
}

/// Cross-node fan-out.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherSettings {
    pub enabled: bool,
    /// URL peers use to reach this node's dispatch endpoint. Derived from the
    /// server settings when unset.
    pub advertise_url: Option<String>,
    pub store: StoreKind,
    pub sled_path: String,
    pub forward_timeout_ms: u64,
    pub hook_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub websocket: Option<PartialWebSocketSettings>,
    pub dispatcher: Option<PartialDispatcherSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ws_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub mailbox_capacity: Option<usize>,
    pub request_capacity: Option<usize>,
    pub topics: Option<Vec<String>>,
    pub store: Option<StoreKind>,
    pub sled_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWebSocketSettings {
    pub write_wait_ms: Option<u64>,
    pub max_message_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDispatcherSettings {
    pub enabled: Option<bool>,
    pub advertise_url: Option<String>,
    pub store: Option<StoreKind>,
    pub sled_path: Option<String>,
    pub forward_timeout_ms: Option<u64>,
    pub hook_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let websocket = self.websocket.unwrap_or_default();
        let dispatcher = self.dispatcher.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                ws_port: server.ws_port.unwrap_or(default.server.ws_port),
            },
            broker: BrokerSettings {
                mailbox_capacity: broker
                    .mailbox_capacity
                    .unwrap_or(default.broker.mailbox_capacity),
                request_capacity: broker
                    .request_capacity
                    .unwrap_or(default.broker.request_capacity),
                topics: broker.topics.unwrap_or(default.broker.topics),
                store: broker.store.unwrap_or(default.broker.store),
                sled_path: broker.sled_path.unwrap_or(default.broker.sled_path),
            },
            websocket: WebSocketSettings {
                write_wait_ms: websocket
                    .write_wait_ms
                    .unwrap_or(default.websocket.write_wait_ms),
                max_message_size: websocket
                    .max_message_size
                    .unwrap_or(default.websocket.max_message_size),
            },
            dispatcher: DispatcherSettings {
                enabled: dispatcher.enabled.unwrap_or(default.dispatcher.enabled),
                advertise_url: dispatcher
                    .advertise_url
                    .or(default.dispatcher.advertise_url),
                store: dispatcher.store.unwrap_or(default.dispatcher.store),
                sled_path: dispatcher.sled_path.unwrap_or(default.dispatcher.sled_path),
                forward_timeout_ms: dispatcher
                    .forward_timeout_ms
                    .unwrap_or(default.dispatcher.forward_timeout_ms),
                hook_capacity: dispatcher
                    .hook_capacity
                    .unwrap_or(default.dispatcher.hook_capacity),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

impl Settings {
    /// URL this node advertises to its peers.
    pub fn advertise_url(&self) -> String {
        self.dispatcher.advertise_url.clone().unwrap_or_else(|| {
            format!(
                "http://{}:{}{}",
                self.server.host,
                self.server.port,
                crate::dispatcher::DISPATCH_PATH
            )
        })
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ws_port: 8081,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            request_capacity: 256,
            topics: Vec::new(),
            store: StoreKind::Memory,
            sled_path: "relayhub_topics".to_string(),
        }
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            write_wait_ms: 10_000,
            max_message_size: 512,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            advertise_url: None,
            store: StoreKind::Memory,
            sled_path: "relayhub_peers".to_string(),
            forward_timeout_ms: 5_000,
            hook_capacity: 1_024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
