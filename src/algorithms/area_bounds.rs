//! Area gate: tags the track's hemisphere and instrument mode, and skips
//! tracks that cannot intersect the processed ice sheets.
//!
//! Runs first in the chain, so it also carries the structural validation
//! of the input arrays.

use crate::chain::config::{AreaSelection, ChainConfig};
use crate::chain::context::Context;
use crate::chain::stage::{FinalizeReason, Stage, StageOutcome};
use crate::track::TrackData;
use crate::types::{Hemisphere, InitResult, ProcessResult};

/// Southernmost latitude a Greenland-bound track can start at
const NORTH_LAT_LIMIT: f64 = 55.0;
/// Northernmost latitude an Antarctica-bound track can start at
const SOUTH_LAT_LIMIT: f64 = -56.0;

/// Stage tagging hemisphere and mode, skipping out-of-area tracks
#[derive(Debug, Default)]
pub struct AreaBoundsStage {
    area: Option<AreaSelection>,
}

impl AreaBoundsStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for AreaBoundsStage {
    fn name(&self) -> &str {
        "area_bounds"
    }

    fn initialize(&mut self, config: &ChainConfig) -> InitResult<()> {
        self.area = Some(config.area);
        Ok(())
    }

    fn process(&mut self, track: &TrackData, context: &mut Context) -> ProcessResult<StageOutcome> {
        track.validate()?;

        let first_lat = track.lat_nadir[0];
        let hemisphere = if first_lat < 0.0 {
            Hemisphere::South
        } else {
            Hemisphere::North
        };

        let inside_polar_region = match hemisphere {
            Hemisphere::North => first_lat >= NORTH_LAT_LIMIT,
            Hemisphere::South => first_lat <= SOUTH_LAT_LIMIT,
        };
        if !inside_polar_region {
            return Ok(StageOutcome::Skipped(format!(
                "track starts at latitude {:.2}, outside both polar regions",
                first_lat
            )));
        }

        let area = self.area.unwrap_or(AreaSelection::Both);
        match hemisphere {
            Hemisphere::South if !area.wants_south() => {
                return Ok(StageOutcome::Skipped(
                    "southern track excluded by area selection".to_string(),
                ));
            }
            Hemisphere::North if !area.wants_north() => {
                return Ok(StageOutcome::Skipped(
                    "northern track excluded by area selection".to_string(),
                ));
            }
            _ => {}
        }

        log::debug!(
            "[{}] {} track over the {} hemisphere",
            track.track_id,
            track.instr_mode,
            hemisphere
        );
        context.instr_mode = Some(track.instr_mode);
        context.hemisphere = Some(hemisphere);
        context.lat_nadir = Some(track.lat_nadir.clone());
        context.set_lon_nadir(track.lon_nadir.clone());
        Ok(StageOutcome::Completed)
    }

    fn finalize(&mut self, reason: FinalizeReason) {
        log::debug!("finalize area_bounds ({:?})", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstrumentMode;
    use chrono::{TimeZone, Utc};
    use ndarray::Array1;

    fn track_at(lat: f64) -> TrackData {
        TrackData {
            track_id: "A1".to_string(),
            instr_mode: InstrumentMode::Lrm,
            start_time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            lat_nadir: Array1::from_elem(3, lat),
            lon_nadir: Array1::zeros(3),
            altitude: Array1::from_elem(3, 717_000.0),
            tracker_range: Array1::from_elem(3, 716_000.0),
            geo_corrections: Array1::zeros(3),
            retracker_correction: Array1::zeros(3),
        }
    }

    fn initialized(area: AreaSelection) -> AreaBoundsStage {
        let mut stage = AreaBoundsStage::new();
        let config = ChainConfig {
            area,
            ..ChainConfig::default()
        };
        stage.initialize(&config).unwrap();
        stage
    }

    #[test]
    fn test_tags_hemisphere_and_mode() {
        let mut stage = initialized(AreaSelection::Both);
        let mut ctx = Context::new();
        let outcome = stage.process(&track_at(-75.0), &mut ctx).unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(ctx.hemisphere, Some(Hemisphere::South));
        assert_eq!(ctx.instr_mode, Some(InstrumentMode::Lrm));
        assert_eq!(ctx.lat_nadir.as_ref().unwrap().len(), 3);
        // Nadir longitudes land in the output convention
        assert!(ctx
            .lon_nadir
            .as_ref()
            .unwrap()
            .iter()
            .all(|&l| (0.0..360.0).contains(&l)));
    }

    #[test]
    fn test_mid_latitude_track_skipped_with_context_untouched() {
        let mut stage = initialized(AreaSelection::Both);
        let mut ctx = Context::new();
        let outcome = stage.process(&track_at(30.0), &mut ctx).unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
        assert!(ctx.hemisphere.is_none());
        assert!(ctx.instr_mode.is_none());
    }

    #[test]
    fn test_area_selection_excludes_other_hemisphere() {
        let mut stage = initialized(AreaSelection::GreenlandOnly);
        let mut ctx = Context::new();
        let outcome = stage.process(&track_at(-75.0), &mut ctx).unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));

        let outcome = stage.process(&track_at(72.0), &mut ctx).unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(ctx.hemisphere, Some(Hemisphere::North));
    }
}
