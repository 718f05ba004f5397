//! Per-unit context threaded between stages.
//!
//! The context is created fresh for every unit of work and carries each
//! stage's contributions to the stages after it. Keys are typed fields
//! rather than a string map, so most wiring mistakes are caught at compile
//! time; the `require_*` accessors cover the genuinely run-time cases and
//! fail with an error naming the missing key.

use ndarray::Array1;

use crate::geo::normalize_lon;
use crate::types::{Hemisphere, InstrumentMode, ProcessError, ProcessResult, TrackArray};

/// The mutable per-unit store passed through the stage sequence
#[derive(Debug, Default)]
pub struct Context {
    /// Acquisition mode tag written by the area gate
    pub instr_mode: Option<InstrumentMode>,
    /// Hemisphere tag written by the area gate
    pub hemisphere: Option<Hemisphere>,
    /// Nadir latitude per measurement, degrees
    pub lat_nadir: Option<TrackArray>,
    /// Nadir longitude per measurement, degrees in [0, 360)
    pub lon_nadir: Option<TrackArray>,
    /// Fully corrected range per measurement, meters
    pub corrected_range: Option<TrackArray>,
    /// Which measurements downstream stages should attempt
    pub measurements_to_include: Option<Array1<bool>>,
    /// POCA latitude per measurement, degrees
    pub lat_poca: Option<TrackArray>,
    /// POCA longitude per measurement, degrees in [0, 360)
    pub lon_poca: Option<TrackArray>,
    /// Surface elevation per measurement, meters (NaN where relocation failed)
    pub height: Option<TrackArray>,
    /// Per-measurement relocation success flags
    pub slope_ok: Option<Array1<bool>>,
    /// Great-circle nadir-to-POCA distance, meters
    pub relocation_distance: Option<TrackArray>,
    /// Final product latitude: POCA where valid, nadir fallback otherwise
    pub latitudes: Option<TrackArray>,
    /// Final product longitude, degrees in [0, 360)
    pub longitudes: Option<TrackArray>,
    /// Elevation uncertainty per measurement, meters
    pub uncertainty: Option<TrackArray>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_instr_mode(&self) -> ProcessResult<InstrumentMode> {
        self.instr_mode
            .ok_or(ProcessError::MissingDependency("instr_mode"))
    }

    pub fn require_hemisphere(&self) -> ProcessResult<Hemisphere> {
        self.hemisphere
            .ok_or(ProcessError::MissingDependency("hemisphere"))
    }

    pub fn require_corrected_range(&self) -> ProcessResult<&TrackArray> {
        self.corrected_range
            .as_ref()
            .ok_or(ProcessError::MissingDependency("corrected_range"))
    }

    pub fn require_measurements_to_include(&self) -> ProcessResult<&Array1<bool>> {
        self.measurements_to_include
            .as_ref()
            .ok_or(ProcessError::MissingDependency("measurements_to_include"))
    }

    pub fn require_latitudes(&self) -> ProcessResult<&TrackArray> {
        self.latitudes
            .as_ref()
            .ok_or(ProcessError::MissingDependency("latitudes"))
    }

    pub fn require_longitudes(&self) -> ProcessResult<&TrackArray> {
        self.longitudes
            .as_ref()
            .ok_or(ProcessError::MissingDependency("longitudes"))
    }

    /// Store nadir longitudes, normalizing to the [0, 360) output convention
    pub fn set_lon_nadir(&mut self, lons: TrackArray) {
        self.lon_nadir = Some(lons.mapv(normalize_lon));
    }

    /// Store POCA longitudes, normalizing to the [0, 360) output convention
    pub fn set_lon_poca(&mut self, lons: TrackArray) {
        self.lon_poca = Some(lons.mapv(normalize_lon));
    }

    /// Store final longitudes, normalizing to the [0, 360) output convention
    pub fn set_longitudes(&mut self, lons: TrackArray) {
        self.longitudes = Some(lons.mapv(normalize_lon));
    }
}
