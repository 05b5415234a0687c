//! Container management module
//!
//! Tracks the containers of a stack, drives their lifecycle through a
//! pluggable runtime (docker, or a recording backend for dry runs) and
//! applies restart policies when processes exit.

pub mod config;
pub mod docker;
pub mod lifecycle;
pub mod runtime;

pub use config::{
    ContainerConfig, ContainerStatus, PortMapping, Protocol, RestartPolicy, VolumeMount,
};
pub use docker::DockerRuntime;
pub use lifecycle::{ContainerManager, ExitOutcome};
pub use runtime::{Container, ContainerRuntime, RecordingRuntime};
