// crates/conduit-rpc/src/handlers/users.rs
//
// User record handlers: List, Get, Create, Update, Delete.
// These handlers talk to the persistence collaborator through `UserStore`;
// inputs have already passed the contract's input schema.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use conduit_core::error::RpcError;
use conduit_core::traits::UserStore;
use conduit_core::user::{NewUser, User, UserPatch};

/// Shared handle on the persistence collaborator.
pub type SharedStore = Arc<dyn UserStore>;

// ---------------------------------------------------------------------------
// ListUsers
// ---------------------------------------------------------------------------

/// Handle a ListUsers request. Takes no input.
pub async fn handle_list_users(store: &SharedStore) -> Result<Vec<User>, RpcError> {
    Ok(store.list().await?)
}

// ---------------------------------------------------------------------------
// GetUser
// ---------------------------------------------------------------------------

/// Request addressing one user by id. Used by get and delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdRequest {
    pub id: i64,
}

/// Handle a GetUser request.
pub async fn handle_get_user(store: &SharedStore, request: UserIdRequest) -> Result<User, RpcError> {
    Ok(store.get_by_id(request.id).await?)
}

// ---------------------------------------------------------------------------
// CreateUser
// ---------------------------------------------------------------------------

/// Handle a CreateUser request.
pub async fn handle_create_user(store: &SharedStore, request: NewUser) -> Result<User, RpcError> {
    let user = store.insert(request).await?;
    tracing::info!("Created user {} <{}>", user.id, user.email);
    Ok(user)
}

// ---------------------------------------------------------------------------
// UpdateUser
// ---------------------------------------------------------------------------

/// Request to patch an existing user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    pub id: i64,
    /// Fields to change; absent fields keep their value.
    pub data: UserPatch,
}

/// Handle an UpdateUser request. An empty patch still refreshes `updatedAt`.
pub async fn handle_update_user(
    store: &SharedStore,
    request: UpdateUserRequest,
) -> Result<User, RpcError> {
    Ok(store.update(request.id, request.data).await?)
}

// ---------------------------------------------------------------------------
// DeleteUser
// ---------------------------------------------------------------------------

/// Response from deleting a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUserResponse {
    pub success: bool,
}

/// Handle a DeleteUser request. Deleting an id that does not exist is a
/// not-found error, not a `success: false`.
pub async fn handle_delete_user(
    store: &SharedStore,
    request: UserIdRequest,
) -> Result<DeleteUserResponse, RpcError> {
    if store.delete(request.id).await? {
        tracing::info!("Deleted user {}", request.id);
        Ok(DeleteUserResponse { success: true })
    } else {
        Err(RpcError::NotFound("User not found".to_string()))
    }
}
