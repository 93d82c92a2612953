// crates/conduit-cli/src/commands/users.rs
//
// `conduit users {list, get, create, update, delete}`: user record commands
// over the daemon's HTTP binding.

use clap::Subcommand;
use serde_json::{json, Value};

use conduit_core::{User, UserPatch};

use crate::output::{format_json, format_users, OutputFormat};
use crate::rpc_client;

/// User management subcommands.
#[derive(Debug, Subcommand)]
pub enum UsersCmd {
    /// List every user.
    List,
    /// Get a user by id.
    Get {
        #[arg(long)]
        id: i64,
    },
    /// Create a user.
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
    },
    /// Update a user's email and/or name.
    Update {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete a user by id.
    Delete {
        #[arg(long)]
        id: i64,
    },
}

impl UsersCmd {
    /// Procedure path and input for this command.
    fn call(&self) -> (&'static str, Value) {
        match self {
            UsersCmd::List => ("users.list", Value::Null),
            UsersCmd::Get { id } => ("users.get", json!({ "id": id })),
            UsersCmd::Create { email, name } => {
                ("users.create", json!({ "email": email, "name": name }))
            }
            UsersCmd::Update { id, email, name } => {
                let data = UserPatch {
                    email: email.clone(),
                    name: name.clone(),
                };
                ("users.update", json!({ "id": id, "data": data }))
            }
            UsersCmd::Delete { id } => ("users.delete", json!({ "id": id })),
        }
    }
}

/// Run the users subcommand.
pub async fn run(
    cmd: &UsersCmd,
    endpoint: &str,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (path, input) = cmd.call();
    let value = rpc_client::call_value(endpoint, path, input).await?;

    match cmd {
        UsersCmd::List => {
            let users: Vec<User> = serde_json::from_value(value)?;
            println!("{}", format_users(&users, format));
        }
        UsersCmd::Delete { id } => match format {
            OutputFormat::Json => println!("{}", format_json(&value)),
            OutputFormat::Table => println!("Deleted user {}", id),
        },
        _ => {
            let user: User = serde_json::from_value(value)?;
            match format {
                OutputFormat::Json => println!("{}", format_json(&user)),
                OutputFormat::Table => {
                    println!("{}", format_users(std::slice::from_ref(&user), format))
                }
            }
        }
    }

    Ok(())
}
