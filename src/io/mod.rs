//! I/O modules for loading reference grids and lookup tables

pub mod dem;
pub mod lut;

pub use dem::load_geotiff;
pub use lut::UncertaintyTable;
