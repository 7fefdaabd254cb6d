//! Store layer.
//!
//! The topic runtime talks to persistence through the repository traits in
//! `traits`; `types` holds the shared row types and `error` the unified
//! error. The in-memory adapter in `memory` is the default backend for
//! development and single-process deployments; persistent adapters plug
//! into the same traits.

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::StoreError;
pub use memory::MemoryStore;
pub use traits::{
    MessagesRepository, Store, SubsRepository, TopicsRepository, UsersRepository,
};

/// Configured store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendType {
    #[default]
    Memory,
}

impl fmt::Display for StoreBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackendType::Memory => write!(f, "memory"),
        }
    }
}

/// Open the configured backend.
pub fn open_store(
    backend: StoreBackendType,
    masked_tag_namespaces: Vec<String>,
) -> Result<Store, StoreError> {
    match backend {
        StoreBackendType::Memory => {
            Ok(MemoryStore::with_masked_namespaces(masked_tag_namespaces).store())
        }
    }
}
