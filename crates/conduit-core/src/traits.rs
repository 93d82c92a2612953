// crates/conduit-core/src/traits.rs

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StoreError, ValidationError};
use crate::schema::Schema;
use crate::user::{NewUser, User, UserPatch};

/// The validator boundary.
///
/// Implemented by `SchemaValidator`. Modeled as async so a remote or
/// expensive validator can be dropped in without changing the dispatcher.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate `raw` against `schema`, returning the accepted (possibly
    /// normalized) value or the offending field path and reason.
    async fn validate(&self, schema: &Schema, raw: &Value) -> Result<Value, ValidationError>;
}

/// Trait for persistent user record storage.
///
/// Implemented by conduit-store (in-memory backend).
#[async_trait]
pub trait UserStore: Send + Sync {
    /// List all users, ordered by id.
    async fn list(&self) -> Result<Vec<User>, StoreError>;

    /// Retrieve a user by id.
    async fn get_by_id(&self, id: i64) -> Result<User, StoreError>;

    /// Insert a new user, assigning its id and timestamps.
    async fn insert(&self, fields: NewUser) -> Result<User, StoreError>;

    /// Apply a partial update and refresh `updated_at`.
    async fn update(&self, id: i64, fields: UserPatch) -> Result<User, StoreError>;

    /// Delete a user. Returns `false` if no such user existed.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;
}
