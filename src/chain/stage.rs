//! The stage contract every chain algorithm implements.

use crate::chain::config::ChainConfig;
use crate::chain::context::Context;
use crate::track::TrackData;
use crate::types::{InitResult, ProcessResult};

/// Result of a successful `process` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and contributed its context keys
    Completed,
    /// The stage does not apply to this unit (wrong mode, wrong area);
    /// the context is untouched and the message is advisory, not an error
    Skipped(String),
}

/// Lifecycle position of a stage instance; strictly one-way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Uninitialized,
    Initialized,
    Processing,
    Finalized,
}

/// Why `finalize` is being called, for lifecycle logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    /// All units processed, normal pool shutdown
    RunComplete,
    /// The worker's own (or a sibling's) initialize failed
    StartupFailure,
    /// The run was cancelled between units
    Cancelled,
}

/// A unit of computation in the chain.
///
/// One instance lives per worker for the whole run: `initialize` runs once
/// before any unit and acquires the stage's resources, `process` runs once
/// per unit, and `finalize` releases whatever `initialize` managed to
/// acquire - it is called exactly once even after a partial or failed
/// initialize, must release each resource at most once, and must not panic
/// past its boundary (log and swallow).
pub trait Stage: Send {
    /// Stage name used in reports and logs
    fn name(&self) -> &str;

    /// Acquire resources and validate configuration; called at most once
    fn initialize(&mut self, config: &ChainConfig) -> InitResult<()>;

    /// Process one unit: read the track and upstream context keys, write
    /// this stage's keys. No side effects beyond the context and logging.
    fn process(&mut self, track: &TrackData, context: &mut Context) -> ProcessResult<StageOutcome>;

    /// Release acquired resources; safe from any lifecycle state
    fn finalize(&mut self, reason: FinalizeReason);
}
