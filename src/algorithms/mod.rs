//! Chain algorithm stages

pub mod area_bounds;
pub mod geolocate_poca;
pub mod range_correction;
pub mod uncertainty;

pub use area_bounds::AreaBoundsStage;
pub use geolocate_poca::{GeolocatePocaStage, GridLoader};
pub use range_correction::RangeCorrectionStage;
pub use uncertainty::UncertaintyStage;
