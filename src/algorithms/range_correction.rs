//! Corrected-range stage: folds the geophysical and retracker corrections
//! into the tracker range and flags which measurements are usable
//! downstream.

use ndarray::Array1;

use crate::chain::config::ChainConfig;
use crate::chain::context::Context;
use crate::chain::stage::{FinalizeReason, Stage, StageOutcome};
use crate::track::TrackData;
use crate::types::{InitResult, ProcessResult};

/// Stage producing the fully corrected range and the inclusion mask
#[derive(Debug, Default)]
pub struct RangeCorrectionStage;

impl RangeCorrectionStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for RangeCorrectionStage {
    fn name(&self) -> &str {
        "range_correction"
    }

    fn initialize(&mut self, _config: &ChainConfig) -> InitResult<()> {
        Ok(())
    }

    fn process(&mut self, track: &TrackData, context: &mut Context) -> ProcessResult<StageOutcome> {
        track.validate()?;

        let corrected = &track.tracker_range + &track.geo_corrections + &track.retracker_correction;

        let include: Array1<bool> = corrected
            .iter()
            .zip(track.tracker_range.iter())
            .map(|(&c, &raw)| c.is_finite() && raw > 0.0)
            .collect();

        let excluded = include.iter().filter(|&&ok| !ok).count();
        if excluded > 0 {
            log::info!(
                "[{}] {} of {} measurements excluded by range screening",
                track.track_id,
                excluded,
                track.len()
            );
        }

        context.corrected_range = Some(corrected);
        context.measurements_to_include = Some(include);
        Ok(StageOutcome::Completed)
    }

    fn finalize(&mut self, reason: FinalizeReason) {
        log::debug!("finalize range_correction ({:?})", reason);
    }
}
