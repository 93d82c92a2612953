// crates/conduit-cli/src/commands/health.rs
//
// `conduit health`: check that the daemon's HTTP binding is up.

use crate::output::{format_json, OutputFormat};
use crate::rpc_client;

/// Run the health command.
pub async fn run(endpoint: &str, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let health = rpc_client::health(endpoint).await?;

    match format {
        OutputFormat::Json => println!("{}", format_json(&health)),
        OutputFormat::Table => {
            println!("Conduit daemon at {}", endpoint);
            println!("  Status:    {}", health["status"].as_str().unwrap_or("unknown"));
            println!("  Timestamp: {}", health["timestamp"].as_str().unwrap_or("-"));
        }
    }

    Ok(())
}
