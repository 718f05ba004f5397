//! Point-of-closest-approach geolocation core

pub mod geometry;
pub mod poca;

pub use poca::{geolocate_track, PocaOutput, PocaParams, SurfaceModel};
