// crates/conduit-cli/src/main.rs
//
// CLI entrypoint for the Conduit developer tools.
//
// Provides subcommands for the user procedures and the health check over the
// HTTP binding, and for following the time stream over the raw duplex
// binding.

mod commands;
mod output;
mod rpc_client;

use clap::{Parser, Subcommand};
use commands::time::TimeCmd;
use commands::users::UsersCmd;
use output::OutputFormat;

/// Conduit CLI: developer client for the Conduit daemon.
#[derive(Parser, Debug)]
#[command(name = "conduit", version = "0.1.0", about = "Conduit RPC developer CLI")]
struct Cli {
    /// HTTP endpoint of the conduit-daemon.
    #[arg(long, global = true, default_value = "http://127.0.0.1:3001")]
    http: String,

    /// Raw duplex endpoint (host:port) of the conduit-daemon.
    #[arg(long, global = true, default_value = "127.0.0.1:3002")]
    duplex: String,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// User records: list, get, create, update, delete.
    #[command(subcommand)]
    Users(UsersCmd),

    /// Follow the server time stream.
    Time(TimeCmd),

    /// Check the daemon's health endpoint.
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let format = OutputFormat::from_json_flag(cli.json);

    match &cli.command {
        Commands::Users(cmd) => commands::users::run(cmd, &cli.http, format).await?,
        Commands::Time(cmd) => commands::time::run(cmd, &cli.duplex, format).await?,
        Commands::Health => commands::health::run(&cli.http, format).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_users_get() {
        let cli = Cli::parse_from(["conduit", "--json", "users", "get", "--id", "4"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Users(UsersCmd::Get { id: 4 })));
    }

    #[test]
    fn parses_time_with_count_and_framing() {
        let cli = Cli::parse_from([
            "conduit",
            "time",
            "--count",
            "3",
            "--framing",
            "length-delimited",
            "--duplex",
            "10.0.0.1:4000",
        ]);
        assert_eq!(cli.duplex, "10.0.0.1:4000");
        match cli.command {
            Commands::Time(cmd) => {
                assert_eq!(cmd.count, Some(3));
                assert_eq!(cmd.framing, commands::time::FramingArg::LengthDelimited);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
