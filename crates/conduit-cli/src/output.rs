// crates/conduit-cli/src/output.rs
//
// Output formatting utilities for the Conduit CLI.
// Supports table and JSON output modes.

use serde::Serialize;
use tabled::{Table, Tabled};

use conduit_core::User;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed table output (default).
    Table,
    /// JSON output for machine consumption.
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Table
        }
    }
}

/// A row in the users table.
#[derive(Tabled)]
pub struct UserRow {
    #[tabled(rename = "ID")]
    pub id: i64,
    #[tabled(rename = "Email")]
    pub email: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Created")]
    pub created_at: String,
    #[tabled(rename = "Updated")]
    pub updated_at: String,
}

impl From<&User> for UserRow {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            created_at: user.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            updated_at: user.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Format a slice of Tabled items as a table string.
pub fn format_table<T: Tabled>(data: &[T]) -> String {
    Table::new(data).to_string()
}

/// Format a serializable value as a pretty-printed JSON string.
pub fn format_json<T: Serialize>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|e| format!("JSON serialization error: {}", e))
}

/// Render users in the requested format.
pub fn format_users(users: &[User], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format_json(&users),
        OutputFormat::Table if users.is_empty() => "No users found.".to_string(),
        OutputFormat::Table => {
            let rows: Vec<UserRow> = users.iter().map(UserRow::from).collect();
            format_table(&rows)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        serde_json::from_value(serde_json::json!({
            "id": 7,
            "email": "ada@example.com",
            "name": "Ada",
            "createdAt": "2024-01-02T03:04:05Z",
            "updatedAt": "2024-01-02T03:04:05Z"
        }))
        .unwrap()
    }

    #[test]
    fn table_has_headers_and_values() {
        let out = format_users(&[sample_user()], OutputFormat::Table);
        assert!(out.contains("Email"));
        assert!(out.contains("ada@example.com"));
        assert!(out.contains("2024-01-02 03:04:05"));
    }

    #[test]
    fn json_uses_wire_field_names() {
        let out = format_users(&[sample_user()], OutputFormat::Json);
        assert!(out.contains("\"createdAt\""));
    }

    #[test]
    fn empty_table_says_so() {
        assert_eq!(format_users(&[], OutputFormat::Table), "No users found.");
    }
}
