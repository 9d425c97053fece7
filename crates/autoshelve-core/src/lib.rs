//! Core engine and traits for periodic auto-shelving.
//!
//! This crate defines the snapshot-decision engine and the seams it is driven through:
//! - `VersionControl`: workspaces, pending changes and shelveset storage
//! - `HostContext`: the active project collection
//! - `AutoShelve`: schedule, connection cache and per-workspace fan-out
//! - `HostController`: debugger pause and solution lifecycle
//!
//! The pure decision steps live in [`name`], [`compare`] and [`retention`].

mod backend;
mod config;
mod connection;
mod controller;
mod engine;
mod error;
mod events;
mod types;

pub mod compare;
pub mod memory;
pub mod name;
pub mod retention;

pub use backend::{HostContext, ProjectContext, VersionControl};
pub use config::{interval_duration, EngineConfig, DEFAULT_INTERVAL_MINUTES};
pub use connection::ConnectionLifecycle;
pub use controller::{HostController, RunState};
pub use engine::{AutoShelve, ShelveRun};
pub use error::{ShelveError, ShelveResult};
pub use events::{EventBus, ShelveEvent};
pub use types::{PendingChange, Shelveset, ShelvesetResult, WorkspaceHandle, EXTENSION_NAME};
