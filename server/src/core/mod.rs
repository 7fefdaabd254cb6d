//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use crate::app::{CoreApp, InitError};
pub use cli::{CliConfig, Commands};
pub use config::{AppConfig, ClusterConfig, ServerConfig};
pub use shutdown::ShutdownService;

// Re-export the store handle from the data layer
pub use crate::data::{Store, StoreBackendType};
