//! Slant-range geometry for POCA relocation.
//!
//! The satellite sits at `altitude` above the ellipsoid over the nadir
//! point. A candidate cell a horizontal distance `d` off nadir sits below
//! the local tangent plane by the spherical sagitta `d^2 / 2R`, which
//! matters at the multi-kilometer search radii used over ice sheets
//! (~8 m at 10 km).

/// Drop of the spherical surface below the nadir tangent plane
pub fn sagitta(horizontal_m: f64, earth_radius_m: f64) -> f64 {
    horizontal_m * horizontal_m / (2.0 * earth_radius_m)
}

/// Predicted slant range from the satellite to a surface cell
///
/// `elevation_m` is the cell's surface elevation above the ellipsoid
/// (already dh/dt-corrected where applicable).
pub fn predicted_slant_range(
    altitude_m: f64,
    horizontal_m: f64,
    elevation_m: f64,
    earth_radius_m: f64,
) -> f64 {
    let dz = altitude_m - (elevation_m - sagitta(horizontal_m, earth_radius_m));
    (horizontal_m * horizontal_m + dz * dz).sqrt()
}

/// Surface elevation consistent with the measured range at a point
/// `horizontal_m` off nadir; `None` when the measured range is shorter
/// than the horizontal offset itself (geometrically impossible fix)
pub fn range_consistent_elevation(
    altitude_m: f64,
    horizontal_m: f64,
    measured_range_m: f64,
    earth_radius_m: f64,
) -> Option<f64> {
    let slant2 = measured_range_m * measured_range_m - horizontal_m * horizontal_m;
    if slant2 < 0.0 {
        return None;
    }
    Some(altitude_m - slant2.sqrt() + sagitta(horizontal_m, earth_radius_m))
}
