//! Reference-grid loading from GeoTIFF rasters.
//!
//! Decoding is delegated to GDAL; this module only pulls the first band
//! into a [`RawGrid`] and applies the structural validation every resource
//! must pass before a stage may use it. The grid's projection is part of
//! its configured identity (northern and southern grids live in different
//! polar stereographic systems), not something inferred from the file.

use std::path::Path;

use gdal::Dataset;
use ndarray::Array2;

use crate::geo::Projection;
use crate::resources::RawGrid;
use crate::types::{GeoTransform, ResourceError, ResourceResult};

/// Load one reference grid from a GeoTIFF (or any single-band GDAL raster)
pub fn load_geotiff<P: AsRef<Path>>(path: P, projection: Projection) -> ResourceResult<RawGrid> {
    let path = path.as_ref();
    log::info!("loading reference grid from {}", path.display());

    let dataset = Dataset::open(path)?;
    let geo_transform = dataset.geo_transform()?;
    let (width, height) = dataset.raster_size();

    log::debug!("grid size: {}x{}", width, height);
    log::debug!("grid geotransform: {:?}", geo_transform);

    let rasterband = dataset.rasterband(1)?;
    let void_value = rasterband.no_data_value().unwrap_or(-32768.0) as f32;
    let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

    let data = Array2::from_shape_vec((height, width), band_data.data).map_err(|e| {
        ResourceError::Validation(format!("failed to reshape grid data: {}", e))
    })?;

    let raw = RawGrid {
        data,
        transform: GeoTransform {
            top_left_x: geo_transform[0],
            pixel_width: geo_transform[1],
            top_left_y: geo_transform[3],
            pixel_height: geo_transform[5],
        },
        projection,
        void_value,
    };
    raw.validate()?;

    let valid = raw
        .data
        .iter()
        .filter(|&&v| v.is_finite() && v != raw.void_value)
        .count();
    if valid == 0 {
        return Err(ResourceError::Validation(format!(
            "grid {} contains no valid cells",
            path.display()
        )));
    }
    log::info!(
        "loaded {}: {}x{} cells, {:.1}% valid",
        path.display(),
        raw.data.nrows(),
        raw.data.ncols(),
        100.0 * valid as f64 / raw.data.len() as f64
    );

    Ok(raw)
}
