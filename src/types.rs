use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Real-valued reference grid data (elevation, slope, dh/dt, mask codes)
pub type GridReal = f32;

/// 2D reference grid array (rows x cols, row 0 at the grid origin)
pub type GridArray = Array2<GridReal>;

/// Per-measurement track array
pub type TrackArray = Array1<f64>;

/// Hemisphere a track or reference grid belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hemisphere {
    North,
    South,
}

impl std::fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hemisphere::North => write!(f, "north"),
            Hemisphere::South => write!(f, "south"),
        }
    }
}

/// Altimeter acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentMode {
    /// Low-resolution (pulse-limited) mode over ice-sheet interiors
    Lrm,
    /// SAR interferometric mode over ice-sheet margins
    Sin,
    /// Plain SAR mode
    Sar,
}

impl std::fmt::Display for InstrumentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentMode::Lrm => write!(f, "LRM"),
            InstrumentMode::Sin => write!(f, "SIN"),
            InstrumentMode::Sar => write!(f, "SAR"),
        }
    }
}

/// Geospatial bounding box in degrees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

/// Geospatial transformation parameters (GDAL-style affine, rotation-free)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub top_left_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Map projected coordinates to fractional (row, col) grid indices
    pub fn xy_to_rowcol(&self, x: f64, y: f64) -> (f64, f64) {
        let col = (x - self.top_left_x) / self.pixel_width;
        let row = (y - self.top_left_y) / self.pixel_height;
        (row, col)
    }

    /// Map (row, col) grid indices to the projected coordinates of the cell centre
    pub fn rowcol_to_xy(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.top_left_x + (col as f64 + 0.5) * self.pixel_width;
        let y = self.top_left_y + (row as f64 + 0.5) * self.pixel_height;
        (x, y)
    }
}

/// Error loading or validating a reference grid resource
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("invalid resource content: {0}")]
    Validation(String),

    #[error("shared memory error: {0}")]
    SharedMemory(String),
}

/// Fatal worker-startup error; aborts the run rather than skipping units
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("required configuration key missing: {0}")]
    MissingConfig(String),

    #[error("resource unavailable: {0}")]
    Resource(#[from] ResourceError),
}

/// Per-unit processing error; fails one unit of work, isolated from the rest
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("missing context dependency: {0}")]
    MissingDependency(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for resource loading
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Result type for stage initialization
pub type InitResult<T> = Result<T, InitError>;

/// Result type for per-unit stage processing
pub type ProcessResult<T> = Result<T, ProcessError>;
