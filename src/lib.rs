//! stackrun - orchestrator for a four-service container stack
//!
//! stackrun owns a small deployment: an application server that depends on
//! a search index, a document store and a cache. It provides:
//!
//! - Compose file parsing, validation and dependency-ordered startup
//! - Container lifecycle management with restart policies
//! - Bridged project networks with name resolution
//! - Readiness probes for dependencies that must be serving, not only started
//! - The launcher that fans the server container out into its three processes

pub mod compose;
pub mod container;
pub mod error;
pub mod launcher;
pub mod network;
pub mod readiness;
pub mod settings;
pub mod storage;

pub use error::{Result, StackError};
pub use settings::Settings;
