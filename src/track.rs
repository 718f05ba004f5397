//! Input record: one satellite track's measurement arrays.
//!
//! A track is read-only to the chain. All arrays are fixed-rate and
//! measurement-indexed; shape consistency is validated once per unit and a
//! mismatch fails the unit (structural error), never a single measurement.

use chrono::{DateTime, Utc};

use crate::types::{InstrumentMode, ProcessError, ProcessResult, TrackArray};

/// One unit of work: a single track's raw measurement dataset
#[derive(Debug, Clone)]
pub struct TrackData {
    /// Product identifier the unit is reported under
    pub track_id: String,
    pub instr_mode: InstrumentMode,
    /// Acquisition start, used to advance dh/dt-corrected surfaces to the
    /// measurement epoch
    pub start_time: DateTime<Utc>,
    /// Nadir latitude per measurement, degrees
    pub lat_nadir: TrackArray,
    /// Nadir longitude per measurement, degrees (any wrap convention)
    pub lon_nadir: TrackArray,
    /// Satellite altitude above the ellipsoid, meters
    pub altitude: TrackArray,
    /// Tracker range to the surface, meters
    pub tracker_range: TrackArray,
    /// Sum of geophysical range corrections, meters
    pub geo_corrections: TrackArray,
    /// Retracker range correction, meters
    pub retracker_correction: TrackArray,
}

impl TrackData {
    /// Number of measurements in the track
    pub fn len(&self) -> usize {
        self.lat_nadir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat_nadir.is_empty()
    }

    /// Structural validation run by the first stage that touches the track
    pub fn validate(&self) -> ProcessResult<()> {
        if self.is_empty() {
            return Err(ProcessError::InvalidInput(format!(
                "track {} has no measurements",
                self.track_id
            )));
        }
        let n = self.len();
        let fields: [(&str, &TrackArray); 5] = [
            ("lon_nadir", &self.lon_nadir),
            ("altitude", &self.altitude),
            ("tracker_range", &self.tracker_range),
            ("geo_corrections", &self.geo_corrections),
            ("retracker_correction", &self.retracker_correction),
        ];
        for (name, array) in fields {
            if array.len() != n {
                return Err(ProcessError::InvalidInput(format!(
                    "track {}: {} has {} values, expected {}",
                    self.track_id,
                    name,
                    array.len(),
                    n
                )));
            }
        }
        Ok(())
    }
}
