// crates/conduit-rpc/src/server.rs
//
// RPC server setup: RpcServer and RpcConfig.
//
// One dispatcher (and its session manager) is shared by every enabled
// binding. The HTTP binding runs on tonic's server with HTTP/1.1 accepted;
// the two duplex bindings run their own TCP accept loops. All of them stop
// when the shutdown token fires, after which every remaining peer is closed.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;

use crate::binding::duplex::{self, DuplexOptions};
use crate::binding::events::{self, EventAlias, EventNames, EventOptions};
use crate::binding::framing::{Framing, DEFAULT_MAX_FRAME_LENGTH};
use crate::binding::http::HttpBinding;
use crate::binding::FlowControl;
use crate::dispatcher::Dispatcher;
use crate::handlers::time::DEFAULT_INTERVAL;
use crate::middleware;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// RpcConfig
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    3001
}

fn default_duplex_port() -> u16 {
    3002
}

fn default_events_port() -> u16 {
    3003
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_aliases() -> Vec<EventAlias> {
    vec![EventAlias::time_stream()]
}

fn default_time_interval_ms() -> u64 {
    DEFAULT_INTERVAL.as_millis() as u64
}

/// Request/response binding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_http_port(),
        }
    }
}

/// Raw duplex binding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplexConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_duplex_port")]
    pub port: u16,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_duplex_port(),
            framing: Framing::default(),
            max_frame_length: default_max_frame_length(),
        }
    }
}

/// Event-addressed binding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_events_port")]
    pub port: u16,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    /// Reserved event names.
    #[serde(default)]
    pub names: EventNames,
    /// Answer calls that carry an ack id through the ack frame.
    #[serde(default = "default_true")]
    pub acks: bool,
    #[serde(default = "default_aliases")]
    pub aliases: Vec<EventAlias>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_events_port(),
            framing: Framing::default(),
            max_frame_length: default_max_frame_length(),
            names: EventNames::default(),
            acks: true,
            aliases: default_aliases(),
        }
    }
}

/// Streaming and outbound flow settings shared by the persistent bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(flatten)]
    pub flow: FlowControl,
    /// Interval of the `time.stream` procedure, in milliseconds.
    #[serde(default = "default_time_interval_ms")]
    pub time_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            flow: FlowControl::default(),
            time_interval_ms: default_time_interval_ms(),
        }
    }
}

/// Configuration for the RPC server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub duplex: DuplexConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

impl RpcConfig {
    /// Enable exactly the given bindings.
    pub fn only(mut self, bindings: &[BindingKind]) -> Self {
        self.http.enabled = bindings.contains(&BindingKind::Http);
        self.duplex.enabled = bindings.contains(&BindingKind::Duplex);
        self.events.enabled = bindings.contains(&BindingKind::Events);
        self
    }

    pub fn time_interval(&self) -> Duration {
        Duration::from_millis(self.streaming.time_interval_ms)
    }

    pub fn duplex_options(&self) -> DuplexOptions {
        DuplexOptions {
            framing: self.duplex.framing,
            max_frame_length: self.duplex.max_frame_length,
            flow: self.streaming.flow,
        }
    }

    pub fn event_options(&self) -> EventOptions {
        EventOptions {
            framing: self.events.framing,
            max_frame_length: self.events.max_frame_length,
            flow: self.streaming.flow,
            names: self.events.names.clone(),
            acks: self.events.acks,
            aliases: self.events.aliases.clone(),
        }
    }
}

/// Selectable transport bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Http,
    Duplex,
    Events,
}

impl FromStr for BindingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(BindingKind::Http),
            "duplex" | "raw" => Ok(BindingKind::Duplex),
            "events" | "event" => Ok(BindingKind::Events),
            other => Err(format!(
                "unknown binding '{}' (expected http, duplex or events)",
                other
            )),
        }
    }
}

impl std::fmt::Display for BindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingKind::Http => write!(f, "http"),
            BindingKind::Duplex => write!(f, "duplex"),
            BindingKind::Events => write!(f, "events"),
        }
    }
}

// ---------------------------------------------------------------------------
// RpcServer
/// Resolve a configured `host` the way `TcpListener::bind` does for the
/// duplex bindings, so hostnames and bare IPv6 literals work for HTTP too.
/// The first resolved address wins.
async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, BoxError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| format!("Host {} did not resolve to any address", host).into())
}

// ---------------------------------------------------------------------------

/// Runs the enabled bindings over one shared dispatcher.
#[derive(Debug, Clone)]
pub struct RpcServer {
    config: RpcConfig,
    dispatcher: Dispatcher,
}

impl RpcServer {
    pub fn new(config: RpcConfig, dispatcher: Dispatcher) -> Self {
        Self { config, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Bind every enabled binding and serve until `shutdown` fires or a
    /// binding fails. A failing binding cancels the others.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), BoxError> {
        let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();

        if self.config.http.enabled {
            let addr = resolve_addr(&self.config.http.host, self.config.http.port).await?;
            let service = InterceptedService::new(
                HttpBinding::new(self.dispatcher.clone()),
                middleware::logging_interceptor,
            );
            let signal = shutdown.clone();
            tracing::info!("http binding listening on {}", addr);
            tasks.spawn(async move {
                Server::builder()
                    .accept_http1(true)
                    .add_service(service)
                    .serve_with_shutdown(addr, async move { signal.cancelled().await })
                    .await?;
                tracing::info!("http binding stopped");
                Ok(())
            });
        }

        if self.config.duplex.enabled {
            let listener =
                TcpListener::bind((self.config.duplex.host.as_str(), self.config.duplex.port))
                    .await?;
            let serving = duplex::serve(
                listener,
                self.dispatcher.clone(),
                self.config.duplex_options(),
                shutdown.clone(),
            );
            tasks.spawn(async move { Ok(serving.await?) });
        }

        if self.config.events.enabled {
            let listener =
                TcpListener::bind((self.config.events.host.as_str(), self.config.events.port))
                    .await?;
            let serving = events::serve(
                listener,
                self.dispatcher.clone(),
                self.config.event_options(),
                shutdown.clone(),
            );
            tasks.spawn(async move { Ok(serving.await?) });
        }

        if tasks.is_empty() {
            tracing::warn!("No bindings enabled; nothing to serve");
            return Ok(());
        }

        let mut first_error: Option<BoxError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(BoxError::from).and_then(|r| r);
            if let Err(e) = result {
                tracing::error!("Binding failed: {}", e);
                shutdown.cancel();
                first_error.get_or_insert(e);
            }
        }

        let torn_down = self.dispatcher.sessions().close_all();
        tracing::info!("RPC server stopped; {} session(s) torn down", torn_down);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_names_parse() {
        assert_eq!("http".parse::<BindingKind>().unwrap(), BindingKind::Http);
        assert_eq!(" Duplex ".parse::<BindingKind>().unwrap(), BindingKind::Duplex);
        assert_eq!("events".parse::<BindingKind>().unwrap(), BindingKind::Events);
        assert!("smoke-signals".parse::<BindingKind>().is_err());
    }

    #[test]
    fn only_enables_selected_bindings() {
        let config = RpcConfig::default().only(&[BindingKind::Duplex]);
        assert!(!config.http.enabled);
        assert!(config.duplex.enabled);
        assert!(!config.events.enabled);
    }

    #[test]
    fn options_carry_shared_flow_control() {
        let mut config = RpcConfig::default();
        config.streaming.flow.backpressure = false;
        config.duplex.framing = Framing::LengthDelimited;
        assert_eq!(config.duplex_options().framing, Framing::LengthDelimited);
        assert!(!config.duplex_options().flow.backpressure);
        assert!(!config.event_options().flow.backpressure);
        assert_eq!(config.time_interval(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn http_host_resolves_names_and_ipv6_literals() {
        let local = resolve_addr("localhost", 3001).await.unwrap();
        assert!(local.ip().is_loopback());
        assert_eq!(local.port(), 3001);

        let v6 = resolve_addr("::1", 4000).await.unwrap();
        assert_eq!(v6, "[::1]:4000".parse::<SocketAddr>().unwrap());

        let v4 = resolve_addr("127.0.0.1", 0).await.unwrap();
        assert_eq!(v4, "127.0.0.1:0".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn http_binding_starts_on_a_hostname() {
        let store = std::sync::Arc::new(conduit_store::MemoryUserStore::new());
        let dispatcher = crate::api::build_dispatcher(store, DEFAULT_INTERVAL).unwrap();
        let mut config = RpcConfig::default().only(&[BindingKind::Http]);
        config.http.host = "localhost".to_string();
        config.http.port = 0;
        let server = RpcServer::new(config, dispatcher);

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let (result, ()) = tokio::join!(server.start(shutdown), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        assert!(result.is_ok(), "{:?}", result.err().map(|e| e.to_string()));
    }

    #[tokio::test]
    async fn start_with_no_bindings_returns_immediately() {
        let store = std::sync::Arc::new(conduit_store::MemoryUserStore::new());
        let dispatcher = crate::api::build_dispatcher(store, DEFAULT_INTERVAL).unwrap();
        let server = RpcServer::new(RpcConfig::default().only(&[]), dispatcher);
        server.start(CancellationToken::new()).await.unwrap();
    }
}
