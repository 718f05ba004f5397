//! floe: A Fast, Modular Radar-Altimeter Land-Ice Elevation Processor
//!
//! This library turns satellite radar-altimeter tracks into geolocated
//! surface-elevation estimates with per-measurement uncertainty. A fixed
//! chain of stages runs once per unit of work (one track), workers host
//! long-lived stage instances so the multi-gigabyte reference grids are
//! loaded once, and the grids can be backed by named shared memory so
//! concurrent chain processes map a single physical copy.

pub mod algorithms;
pub mod chain;
pub mod geo;
pub mod geolocate;
pub mod io;
pub mod resources;
pub mod track;
pub mod types;

// Re-export main types for easier access
pub use chain::{
    AreaSelection, Chain, ChainConfig, Context, Dispatcher, FinalizeReason, RunReport, Stage,
    StageOutcome, UnitOutcome, UnitReport,
};
pub use geolocate::{geolocate_track, PocaOutput, PocaParams, SurfaceModel};
pub use resources::{Grid, GridHandle, RawGrid, ResourceBroker};
pub use track::TrackData;
pub use types::{
    Hemisphere, InitError, InstrumentMode, ProcessError, ResourceError, TrackArray,
};
