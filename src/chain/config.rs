//! Chain configuration.
//!
//! One [`ChainConfig`] is built by the caller (file loading and merging
//! happen outside the chain) and handed unchanged to every worker. Stages
//! validate the keys they need during `initialize` and fail fast with an
//! error naming the missing key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{InitError, InitResult};

/// Which ice sheets this run processes; restricting to one hemisphere
/// halves the reference grids a worker has to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AreaSelection {
    Both,
    AntarcticaOnly,
    GreenlandOnly,
}

impl AreaSelection {
    pub fn wants_south(&self) -> bool {
        matches!(self, AreaSelection::Both | AreaSelection::AntarcticaOnly)
    }

    pub fn wants_north(&self) -> bool {
        matches!(self, AreaSelection::Both | AreaSelection::GreenlandOnly)
    }
}

/// Settings for the POCA relocation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeolocationConfig {
    /// Maximum off-nadir relocation distance searched on the coarse grid, meters
    pub max_relocation_distance: f64,
    /// Half-width of the fine-grid refinement window, meters
    pub fine_search_halfwidth: f64,
    /// Largest acceptable |predicted - measured| range residual, meters
    pub residual_tolerance: f64,
    /// Apply the elevation-rate correction where a dh/dt grid is configured
    pub include_dhdt_correction: bool,
    /// Epoch the dh/dt-corrected reference surfaces are valid at
    pub dhdt_reference_epoch: DateTime<Utc>,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            max_relocation_distance: 10_000.0,
            fine_search_halfwidth: 500.0,
            residual_tolerance: 100.0,
            include_dhdt_correction: false,
            dhdt_reference_epoch: Utc.with_ymd_and_hms(2010, 7, 1, 0, 0, 0).unwrap(),
        }
    }
}

/// Settings for the uncertainty stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyConfig {
    /// Floor applied to looked-up uncertainties, meters
    pub min_uncertainty: f64,
    /// Ceiling applied to looked-up uncertainties, meters
    pub max_uncertainty: f64,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            min_uncertainty: 0.0,
            max_uncertainty: 25.0,
        }
    }
}

/// Complete chain configuration, identical across all workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Back reference grids with named shared memory so sibling chain
    /// processes map one physical copy
    pub use_shared_memory: bool,
    pub area: AreaSelection,
    /// Reference grid / lookup table locations keyed by resource name
    pub resource_paths: HashMap<String, PathBuf>,
    pub geolocation: GeolocationConfig,
    pub uncertainty: UncertaintyConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            use_shared_memory: false,
            area: AreaSelection::Both,
            resource_paths: HashMap::new(),
            geolocation: GeolocationConfig::default(),
            uncertainty: UncertaintyConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Path for a required resource; failing names the missing key
    pub fn require_path(&self, key: &str) -> InitResult<&Path> {
        self.resource_paths
            .get(key)
            .map(PathBuf::as_path)
            .ok_or_else(|| InitError::MissingConfig(format!("resource_paths:{}", key)))
    }
}
