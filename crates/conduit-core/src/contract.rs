// crates/conduit-core/src/contract.rs
//
// Procedure contracts and the contract registry.
//
// The registry is populated once at startup and then shared behind an `Arc`;
// it has no interior mutability, so it is immutable for the life of the
// server. Duplicate registration is a startup-time error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RpcError};
use crate::schema::Schema;

/// Ordered path segments addressing a procedure, e.g. `["users", "create"]`.
/// Rendered as `users.create`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcedurePath(Vec<String>);

impl ProcedurePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a dotted path such as `users.create`.
    pub fn parse(dotted: &str) -> Self {
        Self::new(dotted.split('.'))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// A path is usable as a registry key if it has at least one segment and
    /// no segment is empty or contains the `.` separator.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|s| !s.is_empty() && !s.contains('.'))
    }
}

impl fmt::Display for ProcedurePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Whether a procedure returns one value or a time-ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Unary,
    Streaming,
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallMode::Unary => write!(f, "unary"),
            CallMode::Streaming => write!(f, "streaming"),
        }
    }
}

/// Immutable declaration of a procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub path: ProcedurePath,
    /// Shape of the call input.
    pub input: Schema,
    /// Shape of the unary result, or of each streamed event.
    pub output: Schema,
    pub mode: CallMode,
}

impl Contract {
    pub fn unary(path: &str, input: Schema, output: Schema) -> Self {
        Self {
            path: ProcedurePath::parse(path),
            input,
            output,
            mode: CallMode::Unary,
        }
    }

    pub fn streaming(path: &str, input: Schema, output: Schema) -> Self {
        Self {
            path: ProcedurePath::parse(path),
            input,
            output,
            mode: CallMode::Streaming,
        }
    }
}

/// Lookup table of contracts keyed by path.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: HashMap<ProcedurePath, Arc<Contract>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract. Fails on an invalid or already-registered path.
    pub fn register(&mut self, contract: Contract) -> Result<(), RegistryError> {
        if !contract.path.is_valid() {
            return Err(RegistryError::InvalidPath(format!("{:?}", contract.path.segments())));
        }
        if self.contracts.contains_key(&contract.path) {
            return Err(RegistryError::Duplicate(contract.path.to_string()));
        }
        self.contracts
            .insert(contract.path.clone(), Arc::new(contract));
        Ok(())
    }

    /// Resolve a path to its contract.
    pub fn resolve(&self, path: &ProcedurePath) -> Result<Arc<Contract>, RpcError> {
        self.contracts
            .get(path)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("Unknown procedure: {}", path)))
    }

    pub fn contains(&self, path: &ProcedurePath) -> bool {
        self.contracts.contains_key(path)
    }

    /// All registered contracts, sorted by path.
    pub fn contracts(&self) -> Vec<Arc<Contract>> {
        let mut all: Vec<_> = self.contracts.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
