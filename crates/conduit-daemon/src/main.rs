// crates/conduit-daemon/src/main.rs
//
// Binary entrypoint for the Conduit RPC daemon.
//
// Parses CLI arguments, loads configuration, initializes tracing, builds the
// procedure catalogue over the in-memory user store, and serves the enabled
// bindings until ctrl-c.

mod config;

use std::sync::Arc;

use clap::Parser;
use config::DaemonConfig;
use tokio_util::sync::CancellationToken;

use conduit_rpc::api;
use conduit_rpc::{BindingKind, RpcServer};
use conduit_store::MemoryUserStore;

/// Conduit daemon: serves the RPC catalogue over HTTP and duplex bindings.
#[derive(Parser, Debug)]
#[command(name = "conduit-daemon", version = "0.1.0", about = "Conduit RPC daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "~/.conduit/config.toml")]
    config: String,

    /// Comma-separated bindings to serve (http, duplex, events).
    /// Overrides the `enabled` flags of the config file.
    #[arg(long, value_delimiter = ',')]
    bindings: Option<Vec<BindingKind>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration from TOML file, falling back to defaults if the file
    // is not found. The warning is held until tracing is up.
    let config_path = expand_tilde(&args.config);
    let (mut daemon_config, load_error) = match DaemonConfig::load(&config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (DaemonConfig::default(), Some(e.to_string())),
    };

    // Initialize tracing subscriber for structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&daemon_config.log_level)),
        )
        .init();

    match load_error {
        None => tracing::info!("Loaded configuration from {}", config_path),
        Some(e) => tracing::warn!(
            "Could not load config from {}: {}. Using defaults.",
            config_path,
            e
        ),
    }

    // CLI --bindings flag overrides the config file value.
    if let Some(bindings) = &args.bindings {
        daemon_config.rpc = daemon_config.rpc.only(bindings);
    }

    let rpc = &daemon_config.rpc;
    tracing::info!("Conduit Daemon v0.1.0");
    if rpc.http.enabled {
        tracing::info!("HTTP endpoint: {}:{}", rpc.http.host, rpc.http.port);
    }
    if rpc.duplex.enabled {
        tracing::info!(
            "Duplex endpoint: {}:{} ({} framing)",
            rpc.duplex.host,
            rpc.duplex.port,
            rpc.duplex.framing
        );
    }
    if rpc.events.enabled {
        tracing::info!(
            "Events endpoint: {}:{} ({} alias(es))",
            rpc.events.host,
            rpc.events.port,
            rpc.events.aliases.len()
        );
    }
    tracing::info!(
        "Back-pressure: {} (outbound buffer {})",
        rpc.streaming.flow.backpressure,
        rpc.streaming.flow.outbound_buffer
    );

    let store = Arc::new(MemoryUserStore::new());
    let dispatcher = api::build_dispatcher(store, rpc.time_interval())?;
    tracing::info!("Registered {} procedure(s)", dispatcher.contracts().len());

    let server = RpcServer::new(daemon_config.rpc.clone(), dispatcher);
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    if let Err(e) = server.start(shutdown).await {
        tracing::error!("RPC server error: {}", e);
        return Err(e.to_string().into());
    }

    tracing::info!("Conduit daemon shut down gracefully");
    Ok(())
}

/// Expand a leading `~/` to the current user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_flag_parses_comma_list() {
        let args = Args::parse_from(["conduit-daemon", "--bindings", "http,events"]);
        assert_eq!(
            args.bindings,
            Some(vec![BindingKind::Http, BindingKind::Events])
        );
        assert_eq!(args.config, "~/.conduit/config.toml");
    }

    #[test]
    fn bindings_flag_rejects_unknown_names() {
        assert!(Args::try_parse_from(["conduit-daemon", "--bindings", "http,carrier-pigeon"]).is_err());
    }

    #[test]
    fn tilde_expands_only_as_prefix() {
        assert_eq!(expand_tilde("/etc/conduit.toml"), "/etc/conduit.toml");
        assert_eq!(expand_tilde("a/~/b"), "a/~/b");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x.toml"), format!("{}/x.toml", home.display()));
        }
    }
}
