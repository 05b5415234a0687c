//! In-container process launcher
//!
//! The orchestrating container runs three processes under one lifecycle.
//! They are started either by a generated bash script, where the last
//! process holds the foreground, or by a [`Supervisor`] that watches each
//! of them.

pub mod script;
pub mod supervisor;

pub use script::{
    LauncherEntry, LauncherScript, Placement, ProcessRole, DEFAULT_SCRIPT_PATH, DEFAULT_WRAPPER,
};
pub use supervisor::{SiblingFailurePolicy, Supervisor};
