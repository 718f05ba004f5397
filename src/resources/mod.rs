//! Reference-grid resources and their shared-memory broker

pub mod broker;
pub mod grid;
#[cfg(unix)]
pub mod shm;

pub use broker::{GridHandle, ResourceBroker};
pub use grid::{Grid, RawGrid};
