// crates/conduit-store/src/memory.rs
//
// In-memory user store.
//
// Ids are assigned from a serial counter starting at 1 and are never reused,
// even after deletion. Email addresses are unique across all records.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use conduit_core::error::StoreError;
use conduit_core::traits::UserStore;
use conduit_core::user::{NewUser, User, UserPatch};

#[derive(Debug)]
struct Inner {
    next_id: i64,
    users: BTreeMap<i64, User>,
}

impl Inner {
    fn email_taken(&self, email: &str, except: Option<i64>) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && Some(u.id) != except)
    }
}

/// `UserStore` backed by a `BTreeMap` behind a tokio `RwLock`.
#[derive(Debug)]
pub struct MemoryUserStore {
    inner: RwLock<Inner>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                users: BTreeMap::new(),
            }),
        }
    }

    /// Number of stored users.
    pub async fn len(&self) -> usize {
        self.inner.read().await.users.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

fn duplicate_email() -> StoreError {
    StoreError::Conflict {
        field: "email".to_string(),
        reason: "Email already registered".to_string(),
    }
}

fn user_not_found() -> StoreError {
    StoreError::NotFound("User".to_string())
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn list(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.inner.read().await.users.values().cloned().collect())
    }

    async fn get_by_id(&self, id: i64) -> Result<User, StoreError> {
        self.inner
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(user_not_found)
    }

    async fn insert(&self, fields: NewUser) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.email_taken(&fields.email, None) {
            return Err(duplicate_email());
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let now = Utc::now();
        let user = User {
            id,
            email: fields.email,
            name: fields.name,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(id, user.clone());
        tracing::debug!("Inserted user {}", id);
        Ok(user)
    }

    async fn update(&self, id: i64, fields: UserPatch) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(email) = fields.email.as_deref() {
            if inner.email_taken(email, Some(id)) {
                return Err(duplicate_email());
            }
        }

        let user = inner.users.get_mut(&id).ok_or_else(user_not_found)?;
        if let Some(email) = fields.email {
            user.email = email;
        }
        if let Some(name) = fields.name {
            user.name = name;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let removed = self.inner.write().await.users.remove(&id).is_some();
        if removed {
            tracing::debug!("Deleted user {}", id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str, name: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_serial_ids() {
        let store = MemoryUserStore::new();
        let a = store.insert(new_user("a@x.io", "A")).await.unwrap();
        let b = store.insert(new_user("b@x.io", "B")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.created_at, a.updated_at);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_delete() {
        let store = MemoryUserStore::new();
        let a = store.insert(new_user("a@x.io", "A")).await.unwrap();
        assert!(store.delete(a.id).await.unwrap());
        let b = store.insert(new_user("a@x.io", "A")).await.unwrap();
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryUserStore::new();
        assert_eq!(store.get_by_id(42).await.unwrap_err(), user_not_found());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = MemoryUserStore::new();
        store.insert(new_user("a@x.io", "A")).await.unwrap();
        let err = store.insert(new_user("a@x.io", "Other")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref field, .. } if field == "email"));
    }

    #[tokio::test]
    async fn update_applies_patch_and_refreshes_timestamp() {
        let store = MemoryUserStore::new();
        let a = store.insert(new_user("a@x.io", "A")).await.unwrap();
        let patched = store
            .update(
                a.id,
                UserPatch {
                    email: None,
                    name: Some("Renamed".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.name, "Renamed");
        assert_eq!(patched.email, "a@x.io");
        assert!(patched.updated_at >= a.updated_at);
        assert_eq!(patched.created_at, a.created_at);
    }

    #[tokio::test]
    async fn update_may_keep_own_email() {
        let store = MemoryUserStore::new();
        let a = store.insert(new_user("a@x.io", "A")).await.unwrap();
        let patch = UserPatch {
            email: Some("a@x.io".to_string()),
            name: None,
        };
        assert!(store.update(a.id, patch).await.is_ok());
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = MemoryUserStore::new();
        let err = store.update(9, UserPatch::default()).await.unwrap_err();
        assert_eq!(err, user_not_found());
    }

    #[tokio::test]
    async fn delete_missing_returns_false() {
        let store = MemoryUserStore::new();
        assert!(!store.delete(1).await.unwrap());
    }
}
