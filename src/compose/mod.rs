//! Docker Compose compatible orchestration
//!
//! Parses compose files, orders services by their dependencies and brings
//! a project up against the container and network managers.

pub mod config;
pub mod graph;
pub mod orchestrator;
pub mod parser;
pub mod topology;

pub use config::{ComposeConfig, ServiceConfig};
pub use graph::DependencyGraph;
pub use orchestrator::{ComposeOrchestrator, ServiceStatus, StartupOptions};
pub use parser::ComposeParser;
