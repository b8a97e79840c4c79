//! Run lifecycle orchestration.
//!
//! This module owns the per-script run/stop state machine and the processing that turns a
//! run reply into visible output, parsed views, and a log entry. Presentation layers call into
//! the controller and listen for `ConsoleEvent`s.

mod controller;
mod post_process;

pub use controller::RunOrchestrator;
pub(crate) use post_process::offers_table_view;

/// Why a run affordance is unavailable. A rejected run changes no state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunRejected {
    #[error("missing values for inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),
    #[error("'{value}' is not an option for input '{key}'")]
    InvalidChoice { key: String, value: String },
    #[error("script is already running")]
    AlreadyRunning,
    #[error("session has ended")]
    SessionClosed,
}
