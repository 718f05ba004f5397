//! Point-of-closest-approach relocation engine.
//!
//! For every measurement the engine searches the reference surface for the
//! cell whose predicted slant range best matches the measured range: a
//! coarse-grid sweep inside the maximum off-nadir radius, then a
//! fine-grid refinement around the coarse winner. Candidates must pass the
//! surface-type mask and may carry a time-scaled dh/dt correction. Each
//! measurement is independent, so the track batches across rayon; a
//! measurement that cannot be relocated is data (nadir coordinates, NaN
//! elevation, cleared flag), never a stage failure.

use ndarray::Array1;
use rayon::prelude::*;

use crate::geo::great_circle_distance_m;
use crate::resources::Grid;
use crate::types::{ProcessError, ProcessResult, TrackArray};

use super::geometry::{predicted_slant_range, range_consistent_elevation};

/// Numeric knobs for the relocation search; all externally configured
#[derive(Debug, Clone)]
pub struct PocaParams {
    /// Maximum off-nadir relocation distance, meters
    pub max_relocation_distance: f64,
    /// Half-width of the fine refinement window, meters
    pub fine_search_halfwidth: f64,
    /// Largest acceptable |predicted - measured| residual, meters
    pub residual_tolerance: f64,
    /// Mean earth radius for the sagitta term, meters
    pub earth_radius: f64,
}

impl Default for PocaParams {
    fn default() -> Self {
        Self {
            max_relocation_distance: 10_000.0,
            fine_search_halfwidth: 500.0,
            residual_tolerance: 100.0,
            earth_radius: crate::geo::EARTH_RADIUS_M,
        }
    }
}

/// Reference surface the search runs against
///
/// Auxiliary grids (mask, dh/dt) are expected in the same projected system
/// as the elevation grids for their hemisphere; lookups go through each
/// grid's own transform.
pub struct SurfaceModel<'a> {
    pub coarse: &'a Grid,
    pub fine: &'a Grid,
    /// Surface-type mask; cells with value <= 0 are excluded from the search
    pub surface_mask: Option<&'a Grid>,
    /// Elevation-rate grid, meters per year
    pub dhdt: Option<&'a Grid>,
    /// Years between the dh/dt reference epoch and the measurement epoch
    pub dhdt_years: f64,
}

/// One measurement's relocation result
#[derive(Debug, Clone, Copy)]
struct PocaFix {
    lat: f64,
    lon: f64,
    height: f64,
    slope_ok: bool,
    relocation_distance: f64,
}

impl PocaFix {
    fn at_nadir(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            height: f64::NAN,
            slope_ok: false,
            relocation_distance: 0.0,
        }
    }
}

/// Relocation results for a whole track
#[derive(Debug)]
pub struct PocaOutput {
    pub lat_poca: TrackArray,
    pub lon_poca: TrackArray,
    pub height: TrackArray,
    pub slope_ok: Array1<bool>,
    pub relocation_distance: TrackArray,
    /// Share of measurements that could not be relocated, 0..=100
    pub failure_percent: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    lat: f64,
    lon: f64,
    horizontal_m: f64,
    residual: f64,
}

/// Best mask-passing candidate inside `radius_m` of `center` on one grid
///
/// `center` and the returned candidate are geodetic; horizontal offsets are
/// great-circle distances from the *nadir* point, which is what the range
/// prediction needs. Masked, void and out-of-radius cells drop out early.
fn best_candidate(
    grid: &Grid,
    surface: &SurfaceModel<'_>,
    center: (f64, f64),
    radius_m: f64,
    nadir: (f64, f64),
    max_d: f64,
    altitude: f64,
    measured_range: f64,
    params: &PocaParams,
) -> Option<Candidate> {
    let (cx, cy) = grid.projection().forward(center.0, center.1);
    let (row_range, col_range) = grid.window_around_xy(cx, cy, radius_m, center.0);

    let mut best: Option<Candidate> = None;
    for row in row_range {
        for col in col_range.clone() {
            let Some(elevation) = grid.cell(row, col) else {
                continue;
            };
            let (x, y) = grid.transform().rowcol_to_xy(row, col);
            let (lat, lon) = grid.projection().inverse(x, y);

            let d = great_circle_distance_m(nadir.0, nadir.1, lat, lon);
            if d > max_d {
                continue;
            }

            if let Some(mask) = surface.surface_mask {
                match mask.nearest_at_latlon(lat, lon) {
                    Some(v) if v > 0.0 => {}
                    _ => continue,
                }
            }

            let mut elevation = elevation as f64;
            if let Some(dhdt) = surface.dhdt {
                if let Some(rate) = dhdt.value_at_latlon(lat, lon) {
                    elevation += rate * surface.dhdt_years;
                }
            }

            let predicted =
                predicted_slant_range(altitude, d, elevation, params.earth_radius);
            let residual = (predicted - measured_range).abs();

            if best.map_or(true, |b| residual < b.residual) {
                best = Some(Candidate {
                    lat,
                    lon,
                    horizontal_m: d,
                    residual,
                });
            }
        }
    }
    best
}

fn locate_one(
    nadir_lat: f64,
    nadir_lon: f64,
    altitude: f64,
    measured_range: f64,
    include: bool,
    surface: &SurfaceModel<'_>,
    params: &PocaParams,
) -> PocaFix {
    let nadir_fix = PocaFix::at_nadir(nadir_lat, nadir_lon);

    if !include
        || !nadir_lat.is_finite()
        || !nadir_lon.is_finite()
        || !altitude.is_finite()
        || !measured_range.is_finite()
    {
        return nadir_fix;
    }

    let nadir = (nadir_lat, nadir_lon);

    // Coarse sweep of the full off-nadir search disc
    let Some(coarse) = best_candidate(
        surface.coarse,
        surface,
        nadir,
        params.max_relocation_distance,
        nadir,
        params.max_relocation_distance,
        altitude,
        measured_range,
        params,
    ) else {
        return nadir_fix;
    };

    // Refine on the fine grid around the coarse winner, still bounded by
    // the off-nadir limit
    let Some(fix) = best_candidate(
        surface.fine,
        surface,
        (coarse.lat, coarse.lon),
        params.fine_search_halfwidth,
        nadir,
        params.max_relocation_distance,
        altitude,
        measured_range,
        params,
    ) else {
        return nadir_fix;
    };

    if fix.residual > params.residual_tolerance {
        return nadir_fix;
    }

    let Some(height) = range_consistent_elevation(
        altitude,
        fix.horizontal_m,
        measured_range,
        params.earth_radius,
    ) else {
        return nadir_fix;
    };

    PocaFix {
        lat: fix.lat,
        lon: fix.lon,
        height,
        slope_ok: true,
        relocation_distance: great_circle_distance_m(nadir_lat, nadir_lon, fix.lat, fix.lon),
    }
}

/// Relocate every measurement of one track to its POCA
///
/// Array-length mismatches are structural and fail the unit; everything
/// else degrades per measurement.
pub fn geolocate_track(
    lat_nadir: &TrackArray,
    lon_nadir: &TrackArray,
    altitude: &TrackArray,
    corrected_range: &TrackArray,
    include: &Array1<bool>,
    surface: &SurfaceModel<'_>,
    params: &PocaParams,
) -> ProcessResult<PocaOutput> {
    let n = lat_nadir.len();
    for (name, len) in [
        ("lon_nadir", lon_nadir.len()),
        ("altitude", altitude.len()),
        ("corrected_range", corrected_range.len()),
        ("measurements_to_include", include.len()),
    ] {
        if len != n {
            return Err(ProcessError::InvalidInput(format!(
                "{} has {} values, expected {}",
                name, len, n
            )));
        }
    }

    let fixes: Vec<PocaFix> = (0..n)
        .into_par_iter()
        .map(|i| {
            locate_one(
                lat_nadir[i],
                lon_nadir[i],
                altitude[i],
                corrected_range[i],
                include[i],
                surface,
                params,
            )
        })
        .collect();

    let failed = fixes.iter().filter(|f| !f.slope_ok).count();
    let failure_percent = if n == 0 {
        0.0
    } else {
        100.0 * failed as f64 / n as f64
    };

    Ok(PocaOutput {
        lat_poca: fixes.iter().map(|f| f.lat).collect(),
        lon_poca: fixes.iter().map(|f| f.lon).collect(),
        height: fixes.iter().map(|f| f.height).collect(),
        slope_ok: fixes.iter().map(|f| f.slope_ok).collect(),
        relocation_distance: fixes.iter().map(|f| f.relocation_distance).collect(),
        failure_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Projection;
    use crate::resources::RawGrid;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    const ALT: f64 = 717_000.0;

    /// Geographic grid with ~111 m cells centred on (0, 0)
    fn small_grid(data: Array2<f32>) -> Grid {
        let (rows, cols) = data.dim();
        let raw = RawGrid {
            data,
            transform: GeoTransform {
                top_left_x: -0.001 * (cols as f64) / 2.0,
                pixel_width: 0.001,
                top_left_y: 0.001 * (rows as f64) / 2.0,
                pixel_height: -0.001,
            },
            projection: Projection::Geographic,
            void_value: -9999.0,
        };
        Grid::from_raw("poca_test", raw).unwrap()
    }

    fn surface<'a>(coarse: &'a Grid, fine: &'a Grid) -> SurfaceModel<'a> {
        SurfaceModel {
            coarse,
            fine,
            surface_mask: None,
            dhdt: None,
            dhdt_years: 0.0,
        }
    }

    fn params() -> PocaParams {
        PocaParams {
            max_relocation_distance: 2_000.0,
            fine_search_halfwidth: 300.0,
            residual_tolerance: 50.0,
            ..PocaParams::default()
        }
    }

    #[test]
    fn test_flat_surface_zero_residual_relocates_to_nadir() {
        let grid = small_grid(Array2::from_elem((9, 9), 1000.0));
        let surface = surface(&grid, &grid);

        // Nadir on the central cell centre, range consistent with the surface
        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &array![ALT - 1000.0],
            &array![true],
            &surface,
            &params(),
        )
        .unwrap();

        assert!(out.slope_ok[0]);
        assert_relative_eq!(out.height[0], 1000.0, epsilon = 1e-6);
        assert_relative_eq!(out.relocation_distance[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.lat_poca[0], 0.0, epsilon = 1e-9);
        assert_eq!(out.failure_percent, 0.0);
    }

    #[test]
    fn test_sloped_surface_relocates_upslope() {
        // Elevation climbs to the east; a range shorter than the nadir
        // prediction pulls the POCA toward the higher cells
        let mut data = Array2::zeros((9, 9));
        for ((_r, c), v) in data.indexed_iter_mut() {
            *v = 100.0 * c as f32;
        }
        let grid = small_grid(data);
        let surface = surface(&grid, &grid);

        // Nadir at centre (col 4, elevation 400); aim the range at ~col 6
        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &array![ALT - 600.0],
            &array![true],
            &surface,
            &params(),
        )
        .unwrap();

        assert!(out.slope_ok[0]);
        assert!(out.lon_poca[0] > 0.0, "expected eastward relocation");
        assert!(out.relocation_distance[0] > 100.0);
        assert_relative_eq!(out.height[0], 600.0, epsilon = 30.0);
    }

    #[test]
    fn test_all_void_window_fails_at_nadir() {
        let grid = small_grid(Array2::from_elem((9, 9), -9999.0));
        let surface = surface(&grid, &grid);

        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &array![ALT - 1000.0],
            &array![true],
            &surface,
            &params(),
        )
        .unwrap();

        assert!(!out.slope_ok[0]);
        assert!(out.height[0].is_nan());
        assert_relative_eq!(out.lat_poca[0], 0.0);
        assert_relative_eq!(out.relocation_distance[0], 0.0);
        assert_eq!(out.failure_percent, 100.0);
    }

    #[test]
    fn test_residual_tolerance_rejects_inconsistent_range() {
        let grid = small_grid(Array2::from_elem((9, 9), 1000.0));
        let surface = surface(&grid, &grid);

        // Range off by 400 m from anything the surface can explain
        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &array![ALT - 1400.0],
            &array![true],
            &surface,
            &params(),
        )
        .unwrap();

        assert!(!out.slope_ok[0]);
        assert!(out.height[0].is_nan());
    }

    #[test]
    fn test_mask_excludes_cells() {
        let grid = small_grid(Array2::from_elem((9, 9), 1000.0));
        let mask = small_grid(Array2::from_elem((9, 9), 0.0));
        let surface = SurfaceModel {
            coarse: &grid,
            fine: &grid,
            surface_mask: Some(&mask),
            dhdt: None,
            dhdt_years: 0.0,
        };

        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &array![ALT - 1000.0],
            &array![true],
            &surface,
            &params(),
        )
        .unwrap();

        assert!(!out.slope_ok[0], "fully masked window must fail");
    }

    #[test]
    fn test_uniform_dhdt_can_change_the_selected_cell() {
        // Flat 1000 m surface with one 998 m cell two columns east of
        // nadir. The measured range matches the uncorrected nadir cell
        // exactly, so without dh/dt the nadir cell wins with residual 0.
        // A uniform +1 m/yr correction over 2 years lifts every candidate
        // by exactly +2 m, which hands the win to the low cell.
        let mut data = Array2::from_elem((9, 9), 1000.0_f32);
        data[[4, 6]] = 998.0;
        let grid = small_grid(data);
        let dhdt = small_grid(Array2::from_elem((9, 9), 1.0));

        let range = array![ALT - 1000.0];

        let without = surface(&grid, &grid);
        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &range,
            &array![true],
            &without,
            &params(),
        )
        .unwrap();
        assert!(out.slope_ok[0]);
        assert_relative_eq!(out.relocation_distance[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.height[0], 1000.0, epsilon = 1e-6);

        let with = SurfaceModel {
            coarse: &grid,
            fine: &grid,
            surface_mask: None,
            dhdt: Some(&dhdt),
            dhdt_years: 2.0,
        };
        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &range,
            &array![true],
            &with,
            &params(),
        )
        .unwrap();
        assert!(out.slope_ok[0]);
        // Selection moved to the low cell ~222 m east
        assert!(out.lon_poca[0] > 0.0015, "lon_poca = {}", out.lon_poca[0]);
        assert!(out.relocation_distance[0] > 200.0);
    }

    #[test]
    fn test_dhdt_corrected_surface_matches_shifted_range() {
        // Flat surface lifted by exactly +2 m: a range consistent with the
        // corrected surface minimizes at nadir with zero residual, and the
        // output elevation stays measurement-consistent
        let grid = small_grid(Array2::from_elem((9, 9), 1000.0));
        let dhdt = small_grid(Array2::from_elem((9, 9), 1.0));
        let with = SurfaceModel {
            coarse: &grid,
            fine: &grid,
            surface_mask: None,
            dhdt: Some(&dhdt),
            dhdt_years: 2.0,
        };

        let out = geolocate_track(
            &array![0.0],
            &array![0.0],
            &array![ALT],
            &array![ALT - 1002.0],
            &array![true],
            &with,
            &params(),
        )
        .unwrap();

        assert!(out.slope_ok[0]);
        assert_relative_eq!(out.relocation_distance[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.height[0], 1002.0, epsilon = 1e-6);
    }

    #[test]
    fn test_excluded_measurements_fall_back_to_nadir() {
        let grid = small_grid(Array2::from_elem((9, 9), 1000.0));
        let surface = surface(&grid, &grid);

        let out = geolocate_track(
            &array![0.0, 0.0],
            &array![0.0, 0.0],
            &array![ALT, ALT],
            &array![ALT - 1000.0, ALT - 1000.0],
            &array![true, false],
            &surface,
            &params(),
        )
        .unwrap();

        assert!(out.slope_ok[0]);
        assert!(!out.slope_ok[1]);
        assert_eq!(out.failure_percent, 50.0);
        assert!((0.0..=100.0).contains(&out.failure_percent));
    }

    #[test]
    fn test_shape_mismatch_is_structural() {
        let grid = small_grid(Array2::from_elem((9, 9), 1000.0));
        let surface = surface(&grid, &grid);

        let result = geolocate_track(
            &array![0.0, 0.0],
            &array![0.0],
            &array![ALT, ALT],
            &array![700_000.0, 700_000.0],
            &array![true, true],
            &surface,
            &params(),
        );
        assert!(matches!(result, Err(ProcessError::InvalidInput(_))));
    }
}
