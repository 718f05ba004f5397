//! Reference grid resources.
//!
//! A [`Grid`] wraps one large immutable reference surface (elevation model,
//! surface-type mask, slope or dh/dt grid): a 2D array, its spatial
//! transform and projection, and a void sentinel. The cell data lives
//! either on this process's heap or in a shared-memory segment mapped by
//! several worker processes; lookups behave identically either way.

use ndarray::{Array1, ArrayView2};

use crate::geo::Projection;
use crate::types::{GeoTransform, GridArray, GridReal, ResourceError, ResourceResult};

#[cfg(unix)]
use super::shm::SharedSegment;

/// Grid content as produced by a loader, before it is pinned to a backing
#[derive(Debug, Clone)]
pub struct RawGrid {
    pub data: GridArray,
    pub transform: GeoTransform,
    pub projection: Projection,
    pub void_value: GridReal,
}

impl RawGrid {
    /// Structural validation applied to every loaded grid
    pub fn validate(&self) -> ResourceResult<()> {
        let (rows, cols) = self.data.dim();
        if rows < 2 || cols < 2 {
            return Err(ResourceError::Validation(format!(
                "grid too small: {}x{}",
                rows, cols
            )));
        }
        if self.transform.pixel_width == 0.0 || self.transform.pixel_height == 0.0 {
            return Err(ResourceError::Validation(
                "grid transform has zero pixel size".to_string(),
            ));
        }
        Ok(())
    }
}

enum GridData {
    Owned(GridArray),
    #[cfg(unix)]
    Shared(SharedSegment),
}

/// One immutable reference grid; never mutated after load
pub struct Grid {
    name: String,
    data: GridData,
    transform: GeoTransform,
    projection: Projection,
    void_value: GridReal,
}

impl Grid {
    /// Wrap loaded grid content in a heap-backed resource
    pub fn from_raw(name: impl Into<String>, raw: RawGrid) -> ResourceResult<Self> {
        raw.validate()?;
        Ok(Self {
            name: name.into(),
            transform: raw.transform,
            projection: raw.projection,
            void_value: raw.void_value,
            data: GridData::Owned(raw.data),
        })
    }

    /// Wrap a mapped shared-memory segment
    #[cfg(unix)]
    pub(crate) fn from_segment(name: impl Into<String>, segment: SharedSegment) -> ResourceResult<Self> {
        Ok(Self {
            name: name.into(),
            transform: segment.transform(),
            projection: segment.projection()?,
            void_value: segment.void_value(),
            data: GridData::Shared(segment),
        })
    }

    /// Hand the backing segment back, if any, so the broker can release it
    #[cfg(unix)]
    pub(crate) fn into_segment(self) -> Option<SharedSegment> {
        match self.data {
            GridData::Owned(_) => None,
            GridData::Shared(segment) => Some(segment),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn void_value(&self) -> GridReal {
        self.void_value
    }

    pub fn dim(&self) -> (usize, usize) {
        match &self.data {
            GridData::Owned(a) => a.dim(),
            #[cfg(unix)]
            GridData::Shared(s) => (s.rows(), s.cols()),
        }
    }

    /// Cell data as a 2D view, whatever the backing
    pub fn view(&self) -> ArrayView2<'_, GridReal> {
        match &self.data {
            GridData::Owned(a) => a.view(),
            #[cfg(unix)]
            GridData::Shared(s) => ArrayView2::from_shape((s.rows(), s.cols()), s.data())
                .expect("segment length already validated against header dims"),
        }
    }

    fn is_void(&self, v: GridReal) -> bool {
        !v.is_finite() || v == self.void_value
    }

    /// Raw cell value, `None` outside the grid or on a void cell
    pub fn cell(&self, row: usize, col: usize) -> Option<GridReal> {
        let (rows, cols) = self.dim();
        if row >= rows || col >= cols {
            return None;
        }
        let v = self.view()[[row, col]];
        if self.is_void(v) {
            None
        } else {
            Some(v)
        }
    }

    /// Bilinear interpolation at projected coordinates; `None` outside the
    /// grid or when any corner of the enclosing cell is void
    pub fn value_at_xy(&self, x: f64, y: f64) -> Option<f64> {
        let (row, col) = self.transform.xy_to_rowcol(x, y);
        // Shift to cell-centre coordinates before taking corners
        let row = row - 0.5;
        let col = col - 0.5;
        let (rows, cols) = self.dim();
        if row < 0.0 || col < 0.0 {
            return None;
        }
        let r0 = row.floor() as usize;
        let c0 = col.floor() as usize;
        if r0 + 1 >= rows || c0 + 1 >= cols {
            return None;
        }

        let view = self.view();
        let v00 = view[[r0, c0]];
        let v01 = view[[r0, c0 + 1]];
        let v10 = view[[r0 + 1, c0]];
        let v11 = view[[r0 + 1, c0 + 1]];
        if self.is_void(v00) || self.is_void(v01) || self.is_void(v10) || self.is_void(v11) {
            return None;
        }

        let dr = row - r0 as f64;
        let dc = col - c0 as f64;
        let top = v00 as f64 * (1.0 - dc) + v01 as f64 * dc;
        let bottom = v10 as f64 * (1.0 - dc) + v11 as f64 * dc;
        Some(top * (1.0 - dr) + bottom * dr)
    }

    /// Nearest-neighbour cell value at projected coordinates
    pub fn nearest_at_xy(&self, x: f64, y: f64) -> Option<GridReal> {
        let (row, col) = self.transform.xy_to_rowcol(x, y);
        if row < 0.0 || col < 0.0 {
            return None;
        }
        self.cell(row.floor() as usize, col.floor() as usize)
    }

    /// Bilinear interpolation at a geodetic point
    pub fn value_at_latlon(&self, lat: f64, lon: f64) -> Option<f64> {
        let (x, y) = self.projection.forward(lat, lon);
        self.value_at_xy(x, y)
    }

    /// Nearest-neighbour lookup at a geodetic point (for categorical masks)
    pub fn nearest_at_latlon(&self, lat: f64, lon: f64) -> Option<GridReal> {
        let (x, y) = self.projection.forward(lat, lon);
        self.nearest_at_xy(x, y)
    }

    /// Vectorized bilinear interpolation; NaN where the grid has no value
    ///
    /// This is the resource-handle lookup contract consumed by the stages.
    pub fn interpolate(&self, lats: &Array1<f64>, lons: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(
            lats.iter()
                .zip(lons.iter())
                .map(|(&lat, &lon)| self.value_at_latlon(lat, lon).unwrap_or(f64::NAN)),
        )
    }

    /// Index window covering all cells within `radius_m` of the projected
    /// point, clipped to the grid; empty ranges when there is no overlap
    pub fn window_around_xy(
        &self,
        x: f64,
        y: f64,
        radius_m: f64,
        lat_hint: f64,
    ) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let (rows, cols) = self.dim();
        let (ux, uy) = self.projection.units_per_meter(lat_hint);
        let rx = (radius_m * ux / self.transform.pixel_width.abs()).ceil() as i64 + 1;
        let ry = (radius_m * uy / self.transform.pixel_height.abs()).ceil() as i64 + 1;

        let (row, col) = self.transform.xy_to_rowcol(x, y);
        let (row, col) = (row.floor() as i64, col.floor() as i64);

        let r0 = (row - ry).clamp(0, rows as i64) as usize;
        let r1 = (row + ry + 1).clamp(0, rows as i64) as usize;
        let c0 = (col - rx).clamp(0, cols as i64) as usize;
        let c1 = (col + rx + 1).clamp(0, cols as i64) as usize;
        (r0..r1, c0..c1)
    }
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rows, cols) = self.dim();
        f.debug_struct("Grid")
            .field("name", &self.name)
            .field("dim", &(rows, cols))
            .field("projection", &self.projection)
            .finish()
    }
}
