//! Chain orchestrator: runs the ordered stage sequence over one unit.
//!
//! A failure is a property of one unit of work, never of the chain: the
//! orchestrator stops the remaining stages for that unit, reports which
//! stage failed and why, and is immediately ready for the next unit. It
//! never retries.

use std::time::Instant;

use crate::chain::config::ChainConfig;
use crate::chain::context::Context;
use crate::chain::stage::{FinalizeReason, Stage, StageOutcome, StageState};
use crate::track::TrackData;
use crate::types::InitResult;

/// Outcome of one unit of work
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub success: bool,
    /// Name of the first failing stage, if any
    pub failed_stage: Option<String>,
    /// First failure reason; empty on success
    pub reason: String,
}

impl UnitOutcome {
    fn success() -> Self {
        Self {
            success: true,
            failed_stage: None,
            reason: String::new(),
        }
    }

    fn failure(stage: &str, reason: String) -> Self {
        Self {
            success: false,
            failed_stage: Some(stage.to_string()),
            reason,
        }
    }
}

struct StageSlot {
    stage: Box<dyn Stage>,
    state: StageState,
}

/// Fixed, ordered sequence of stage instances; built once per worker and
/// reused for every unit that worker handles
pub struct Chain {
    slots: Vec<StageSlot>,
}

impl Chain {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            slots: stages
                .into_iter()
                .map(|stage| StageSlot {
                    stage,
                    state: StageState::Uninitialized,
                })
                .collect(),
        }
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.stage.name().to_string()).collect()
    }

    /// Initialize every stage in order; the first failure aborts and leaves
    /// the remaining stages untouched (finalize still visits all of them)
    pub fn initialize(&mut self, config: &ChainConfig) -> InitResult<()> {
        for slot in &mut self.slots {
            if slot.state != StageState::Uninitialized {
                log::warn!(
                    "stage {} already initialized; skipping repeat initialize",
                    slot.stage.name()
                );
                continue;
            }
            log::info!("initializing stage {}", slot.stage.name());
            match slot.stage.initialize(config) {
                Ok(()) => slot.state = StageState::Initialized,
                Err(e) => {
                    log::error!("stage {} failed to initialize: {}", slot.stage.name(), e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Execute the stage sequence against one unit of work
    pub fn run(&mut self, track: &TrackData, context: &mut Context) -> UnitOutcome {
        for slot in &mut self.slots {
            let name = slot.stage.name().to_string();
            if slot.state != StageState::Initialized {
                return UnitOutcome::failure(
                    &name,
                    format!("stage {} is {:?}, expected Initialized", name, slot.state),
                );
            }

            slot.state = StageState::Processing;
            let started = Instant::now();
            let result = slot.stage.process(track, context);
            let elapsed = started.elapsed().as_secs_f64();
            slot.state = StageState::Initialized;

            match result {
                Ok(StageOutcome::Completed) => {
                    log::debug!("[{}] stage {} completed in {:.3}s", track.track_id, name, elapsed);
                }
                Ok(StageOutcome::Skipped(msg)) => {
                    log::info!("[{}] stage {} skipped: {}", track.track_id, name, msg);
                }
                Err(e) => {
                    log::error!("[{}] stage {} failed: {}", track.track_id, name, e);
                    return UnitOutcome::failure(&name, e.to_string());
                }
            }
        }
        UnitOutcome::success()
    }

    /// Finalize every stage exactly once, whatever state it reached.
    ///
    /// Safe after a partial initialize: stages release only what they
    /// actually acquired. Calling again is a no-op.
    pub fn finalize(&mut self, reason: FinalizeReason) {
        for slot in &mut self.slots {
            if slot.state == StageState::Finalized {
                continue;
            }
            log::debug!("finalizing stage {} ({:?})", slot.stage.name(), reason);
            slot.stage.finalize(reason);
            slot.state = StageState::Finalized;
        }
    }
}
