//! Storage management module
//!
//! Host directories mounted into containers.

pub mod mount;

pub use mount::{prepare_host_paths, validate_exclusive_mounts, BindMount, MountSource};
