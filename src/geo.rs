//! Geodetic helpers shared by the reference grids and the geolocation engine.
//!
//! Reference grids for both ice sheets live in polar stereographic
//! projections (northern grids on a -45 degree central meridian, southern
//! grids on the Greenwich meridian), so the crate carries its own
//! forward/inverse transform rather than pulling in a projection engine.

use serde::{Deserialize, Serialize};

use crate::types::Hemisphere;

/// WGS84 semi-major axis in meters
pub const WGS84_A: f64 = 6_378_137.0;

/// WGS84 first eccentricity squared
pub const WGS84_E2: f64 = 0.006_694_379_990_14;

/// Mean earth radius in meters, used for great-circle distances and the
/// spherical sagitta term in slant-range prediction
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Normalize a longitude in degrees to the [0, 360) convention used by all
/// chain outputs
pub fn normalize_lon(lon_deg: f64) -> f64 {
    let mut lon = lon_deg % 360.0;
    if lon < 0.0 {
        lon += 360.0;
    }
    lon
}

/// Great-circle distance between two geodetic points, in meters
///
/// Haversine on the mean sphere; accurate to ~0.5% which is ample for
/// relocation distances of a few kilometers.
pub fn great_circle_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Polar stereographic projection (variant with a standard parallel)
///
/// North aspect matches the usual Greenland grid definition (standard
/// parallel 70N, central meridian -45); south aspect matches the usual
/// Antarctic definition (standard parallel 71S, central meridian 0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolarStereo {
    pub pole: Hemisphere,
    /// Standard parallel, absolute degrees
    pub lat_ts_deg: f64,
    /// Central meridian, degrees
    pub lon0_deg: f64,
}

impl PolarStereo {
    /// Northern-hemisphere grid projection (EPSG:3413 parameters)
    pub fn north() -> Self {
        Self {
            pole: Hemisphere::North,
            lat_ts_deg: 70.0,
            lon0_deg: -45.0,
        }
    }

    /// Southern-hemisphere grid projection (EPSG:3031 parameters)
    pub fn south() -> Self {
        Self {
            pole: Hemisphere::South,
            lat_ts_deg: 71.0,
            lon0_deg: 0.0,
        }
    }

    fn e() -> f64 {
        WGS84_E2.sqrt()
    }

    /// Snyder's isometric colatitude function t(phi), north aspect
    fn t(phi: f64) -> f64 {
        let e = Self::e();
        let esin = e * phi.sin();
        (std::f64::consts::FRAC_PI_4 - phi / 2.0).tan()
            / ((1.0 - esin) / (1.0 + esin)).powf(e / 2.0)
    }

    fn m(phi: f64) -> f64 {
        phi.cos() / (1.0 - WGS84_E2 * phi.sin().powi(2)).sqrt()
    }

    /// Geodetic (lat, lon) in degrees to projected (x, y) in meters
    pub fn forward(&self, lat_deg: f64, lon_deg: f64) -> (f64, f64) {
        // South aspect: run the north-aspect equations with all signs
        // reversed (Snyder 1987, p. 161)
        let (lat, lon, lon0) = match self.pole {
            Hemisphere::North => (lat_deg, lon_deg, self.lon0_deg),
            Hemisphere::South => (-lat_deg, -lon_deg, -self.lon0_deg),
        };

        let phi = lat.to_radians();
        let phi_ts = self.lat_ts_deg.to_radians();
        let dlam = (lon - lon0).to_radians();

        let rho = WGS84_A * Self::m(phi_ts) * Self::t(phi) / Self::t(phi_ts);
        let x = rho * dlam.sin();
        let y = -rho * dlam.cos();

        match self.pole {
            Hemisphere::North => (x, y),
            Hemisphere::South => (-x, -y),
        }
    }

    /// Projected (x, y) in meters to geodetic (lat, lon) in degrees
    pub fn inverse(&self, x_m: f64, y_m: f64) -> (f64, f64) {
        let (x, y, lon0) = match self.pole {
            Hemisphere::North => (x_m, y_m, self.lon0_deg),
            Hemisphere::South => (-x_m, -y_m, -self.lon0_deg),
        };

        let phi_ts = self.lat_ts_deg.to_radians();
        let rho = x.hypot(y);
        let t = rho * Self::t(phi_ts) / (WGS84_A * Self::m(phi_ts));

        // Series expansion for the conformal-to-geodetic latitude conversion
        let chi = std::f64::consts::FRAC_PI_2 - 2.0 * t.atan();
        let e2 = WGS84_E2;
        let e4 = e2 * e2;
        let e6 = e4 * e2;
        let e8 = e6 * e2;
        let phi = chi
            + (e2 / 2.0 + 5.0 * e4 / 24.0 + e6 / 12.0 + 13.0 * e8 / 360.0) * (2.0 * chi).sin()
            + (7.0 * e4 / 48.0 + 29.0 * e6 / 240.0 + 811.0 * e8 / 11520.0) * (4.0 * chi).sin()
            + (7.0 * e6 / 120.0 + 81.0 * e8 / 1120.0) * (6.0 * chi).sin()
            + (4279.0 * e8 / 161280.0) * (8.0 * chi).sin();

        let lon = if rho > 0.0 {
            lon0 + x.atan2(-y).to_degrees()
        } else {
            lon0
        };
        let lat = phi.to_degrees();

        match self.pole {
            Hemisphere::North => (lat, lon),
            Hemisphere::South => (-lat, -lon),
        }
    }
}

/// Horizontal coordinate system a reference grid is stored in
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// Plate carree: x is longitude, y is latitude, both in degrees
    Geographic,
    /// Polar stereographic in meters
    PolarStereo(PolarStereo),
}

impl Projection {
    /// Geodetic (lat, lon) in degrees to grid (x, y)
    pub fn forward(&self, lat_deg: f64, lon_deg: f64) -> (f64, f64) {
        match self {
            Projection::Geographic => (lon_deg, lat_deg),
            Projection::PolarStereo(ps) => ps.forward(lat_deg, lon_deg),
        }
    }

    /// Grid (x, y) to geodetic (lat, lon) in degrees
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Projection::Geographic => (y, x),
            Projection::PolarStereo(ps) => ps.inverse(x, y),
        }
    }

    /// Grid distance corresponding to one meter on the ground
    ///
    /// Polar stereographic grids are already metric; geographic grids use a
    /// mid-latitude meters-per-degree scale, good enough for sizing search
    /// windows.
    pub fn units_per_meter(&self, lat_deg: f64) -> (f64, f64) {
        match self {
            Projection::Geographic => {
                let m_per_deg_lat = 111_000.0;
                let m_per_deg_lon = 111_000.0 * lat_deg.to_radians().cos().max(1e-6);
                (1.0 / m_per_deg_lon, 1.0 / m_per_deg_lat)
            }
            Projection::PolarStereo(_) => (1.0, 1.0),
        }
    }
}
