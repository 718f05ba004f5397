//! Chain execution engine: stage contract, per-unit context, orchestrator
//! and the worker-pool dispatcher

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod orchestrator;
pub mod stage;

pub use config::{AreaSelection, ChainConfig, GeolocationConfig, UncertaintyConfig};
pub use context::Context;
pub use dispatcher::{Dispatcher, RunReport, UnitReport};
pub use orchestrator::{Chain, UnitOutcome};
pub use stage::{FinalizeReason, Stage, StageOutcome, StageState};
