//! GPU partition assignment for Hyper-V guests.
//!
//! Attaches a host GPU partition to a guest and provisions the guest's
//! drivers: offline injection into a powered-off Windows disk, or a
//! remote-shell pipeline for Linux guests.

pub mod config;
pub mod disk;
pub mod error;
pub mod gpu;
pub mod guest;
pub mod host;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod remote;
pub mod state_machine;

pub use error::{Error, Result};
pub use orchestrator::{AssignmentRequest, GpuPartitionOrchestrator, HostServices, Outcome, OrchestratorSettings};
pub use progress::{CancelToken, Progress, ProgressEvent, ProgressKind};
