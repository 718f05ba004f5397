//! LRM POCA geolocation stage.
//!
//! Owns the reference surfaces (coarse and fine DEMs per hemisphere, the
//! optional surface-type masks and dh/dt grids), all acquired through the
//! resource broker once per worker, and runs the relocation engine over
//! each LRM track. Per-measurement relocation failures stay data; the
//! stage itself only fails on structural problems.

use std::path::Path;
use std::sync::Arc;

use crate::chain::config::{ChainConfig, GeolocationConfig};
use crate::chain::context::Context;
use crate::chain::stage::{FinalizeReason, Stage, StageOutcome};
use crate::geo::{PolarStereo, Projection, EARTH_RADIUS_M};
use crate::geolocate::{geolocate_track, PocaParams, SurfaceModel};
use crate::io;
use crate::resources::{GridHandle, RawGrid, ResourceBroker};
use crate::track::TrackData;
use crate::types::{
    Hemisphere, InitResult, InstrumentMode, ProcessError, ProcessResult, ResourceResult,
};

/// Loads one reference grid from its configured source; injectable so the
/// stage can be exercised against synthetic surfaces
pub type GridLoader = dyn Fn(&Path, Projection) -> ResourceResult<RawGrid> + Send + Sync;

/// Stage relocating LRM measurements to their point of closest approach
pub struct GeolocatePocaStage {
    broker: Arc<ResourceBroker>,
    loader: Arc<GridLoader>,
    settings: Option<GeolocationConfig>,
    dem_south: Option<GridHandle>,
    dem_south_fine: Option<GridHandle>,
    dem_north: Option<GridHandle>,
    dem_north_fine: Option<GridHandle>,
    mask_south: Option<GridHandle>,
    mask_north: Option<GridHandle>,
    dhdt_south: Option<GridHandle>,
    dhdt_north: Option<GridHandle>,
}

impl GeolocatePocaStage {
    pub fn new(broker: Arc<ResourceBroker>) -> Self {
        Self::with_loader(
            broker,
            Arc::new(|path: &Path, projection: Projection| io::dem::load_geotiff(path, projection)),
        )
    }

    /// Use a custom grid loader (tests feed synthetic surfaces this way)
    pub fn with_loader(broker: Arc<ResourceBroker>, loader: Arc<GridLoader>) -> Self {
        Self {
            broker,
            loader,
            settings: None,
            dem_south: None,
            dem_south_fine: None,
            dem_north: None,
            dem_north_fine: None,
            mask_south: None,
            mask_north: None,
            dhdt_south: None,
            dhdt_north: None,
        }
    }

    fn acquire(
        &self,
        key: &str,
        path: &Path,
        projection: Projection,
        shared: bool,
    ) -> InitResult<GridHandle> {
        let loader = Arc::clone(&self.loader);
        let path_buf = path.to_path_buf();
        let handle = self.broker.acquire_with(
            key,
            &path.to_string_lossy(),
            shared,
            move || loader(&path_buf, projection),
        )?;
        Ok(handle)
    }

    fn acquire_optional(
        &self,
        key: &str,
        config: &ChainConfig,
        projection: Projection,
    ) -> InitResult<Option<GridHandle>> {
        match config.resource_paths.get(key) {
            Some(path) => Ok(Some(self.acquire(
                key,
                path,
                projection,
                config.use_shared_memory,
            )?)),
            None => {
                log::info!("no {} configured; continuing without it", key);
                Ok(None)
            }
        }
    }

    fn acquire_hemisphere(
        &mut self,
        config: &ChainConfig,
        hemisphere: Hemisphere,
    ) -> InitResult<()> {
        let shared = config.use_shared_memory;
        let (dem_key, fine_key, mask_key, dhdt_key, projection) = match hemisphere {
            Hemisphere::South => (
                "antarctic_dem",
                "antarctic_dem_fine",
                "antarctic_surface_mask",
                "antarctic_dhdt",
                Projection::PolarStereo(PolarStereo::south()),
            ),
            Hemisphere::North => (
                "greenland_dem",
                "greenland_dem_fine",
                "greenland_surface_mask",
                "greenland_dhdt",
                Projection::PolarStereo(PolarStereo::north()),
            ),
        };

        // Every handle is stored on self the moment it is acquired, so a
        // failure partway through still lets finalize release the rest
        let coarse_path = config.require_path(dem_key)?.to_path_buf();
        let coarse = self.acquire(dem_key, &coarse_path, projection, shared)?;
        match hemisphere {
            Hemisphere::South => self.dem_south = Some(coarse),
            Hemisphere::North => self.dem_north = Some(coarse),
        }

        // A fine grid configured with the same source reuses the resident
        // coarse grid instead of loading a second copy
        let fine_path = config.require_path(fine_key)?.to_path_buf();
        let fine = if fine_path == coarse_path {
            self.acquire(dem_key, &coarse_path, projection, shared)?
        } else {
            self.acquire(fine_key, &fine_path, projection, shared)?
        };
        match hemisphere {
            Hemisphere::South => self.dem_south_fine = Some(fine),
            Hemisphere::North => self.dem_north_fine = Some(fine),
        }

        let mask = self.acquire_optional(mask_key, config, projection)?;
        match hemisphere {
            Hemisphere::South => self.mask_south = mask,
            Hemisphere::North => self.mask_north = mask,
        }

        if config.geolocation.include_dhdt_correction {
            let dhdt = self.acquire_optional(dhdt_key, config, projection)?;
            match hemisphere {
                Hemisphere::South => self.dhdt_south = dhdt,
                Hemisphere::North => self.dhdt_north = dhdt,
            }
        }
        Ok(())
    }
}

impl Stage for GeolocatePocaStage {
    fn name(&self) -> &str {
        "geolocate_poca"
    }

    fn initialize(&mut self, config: &ChainConfig) -> InitResult<()> {
        if config.geolocation.include_dhdt_correction {
            log::info!("dh/dt correction to reference surfaces enabled");
        }

        if config.area.wants_south() {
            self.acquire_hemisphere(config, Hemisphere::South)?;
        }
        if config.area.wants_north() {
            self.acquire_hemisphere(config, Hemisphere::North)?;
        }

        self.settings = Some(config.geolocation.clone());
        Ok(())
    }

    fn process(&mut self, track: &TrackData, context: &mut Context) -> ProcessResult<StageOutcome> {
        let Some(settings) = self.settings.clone() else {
            return Err(ProcessError::InvalidInput(
                "geolocate_poca processed before initialize".to_string(),
            ));
        };

        let mode = context.require_instr_mode()?;
        if mode != InstrumentMode::Lrm {
            return Ok(StageOutcome::Skipped(format!("not an LRM track ({})", mode)));
        }
        let hemisphere = context.require_hemisphere()?;

        let (dem, dem_fine, mask, dhdt) = match hemisphere {
            Hemisphere::South => (
                &self.dem_south,
                &self.dem_south_fine,
                &self.mask_south,
                &self.dhdt_south,
            ),
            Hemisphere::North => (
                &self.dem_north,
                &self.dem_north_fine,
                &self.mask_north,
                &self.dhdt_north,
            ),
        };
        let Some(dem) = dem.as_ref() else {
            return Err(ProcessError::InvalidInput(format!(
                "no {} hemisphere elevation model loaded",
                hemisphere
            )));
        };
        let fine = dem_fine.as_ref().map(|h| h.grid()).unwrap_or_else(|| dem.grid());

        // Advance the reference surface to the acquisition epoch
        let dhdt_years = (track.start_time - settings.dhdt_reference_epoch).num_seconds() as f64
            / (365.25 * 86_400.0);

        let surface = SurfaceModel {
            coarse: dem.grid(),
            fine,
            surface_mask: mask.as_ref().map(|h| h.grid()),
            dhdt: if settings.include_dhdt_correction {
                dhdt.as_ref().map(|h| h.grid())
            } else {
                None
            },
            dhdt_years,
        };
        let params = PocaParams {
            max_relocation_distance: settings.max_relocation_distance,
            fine_search_halfwidth: settings.fine_search_halfwidth,
            residual_tolerance: settings.residual_tolerance,
            earth_radius: EARTH_RADIUS_M,
        };

        let output = geolocate_track(
            &track.lat_nadir,
            &track.lon_nadir,
            &track.altitude,
            context.require_corrected_range()?,
            context.require_measurements_to_include()?,
            &surface,
            &params,
        )?;

        log::info!(
            "[{}] POCA relocation succeeded in {:.2}% of measurements",
            track.track_id,
            100.0 - output.failure_percent
        );
        let fallbacks = output.slope_ok.iter().filter(|&&ok| !ok).count();
        if fallbacks > 0 {
            log::info!(
                "[{}] POCA replaced by nadir in {} of {} measurements",
                track.track_id,
                fallbacks,
                track.len()
            );
        }

        context.lat_poca = Some(output.lat_poca.clone());
        context.set_lon_poca(output.lon_poca.clone());
        context.height = Some(output.height);
        context.slope_ok = Some(output.slope_ok);
        context.relocation_distance = Some(output.relocation_distance);

        // Final product coordinates: the engine already fell back to nadir
        // wherever relocation failed
        context.latitudes = Some(output.lat_poca);
        context.set_longitudes(output.lon_poca);

        Ok(StageOutcome::Completed)
    }

    fn finalize(&mut self, reason: FinalizeReason) {
        log::debug!("finalize geolocate_poca ({:?})", reason);
        for handle in [
            self.dem_south.take(),
            self.dem_south_fine.take(),
            self.dem_north.take(),
            self.dem_north_fine.take(),
            self.mask_south.take(),
            self.mask_north.take(),
            self.dhdt_south.take(),
            self.dhdt_north.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.broker.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::config::AreaSelection;
    use crate::types::GeoTransform;
    use chrono::{TimeZone, Utc};
    use ndarray::{array, Array2};
    use std::collections::HashMap;
    use std::path::PathBuf;

    const ALT: f64 = 717_000.0;

    /// Loader producing a flat 1000 m geographic grid whatever the path
    fn synthetic_loader() -> Arc<GridLoader> {
        Arc::new(|_path: &Path, _projection: Projection| {
            Ok(RawGrid {
                data: Array2::from_elem((9, 9), 1000.0),
                transform: GeoTransform {
                    top_left_x: -0.0045,
                    pixel_width: 0.001,
                    top_left_y: 0.0045,
                    pixel_height: -0.001,
                },
                projection: Projection::Geographic,
                void_value: -9999.0,
            })
        })
    }

    fn south_config() -> ChainConfig {
        let mut resource_paths = HashMap::new();
        resource_paths.insert("antarctic_dem".to_string(), PathBuf::from("/dems/ant_200m.tif"));
        resource_paths.insert(
            "antarctic_dem_fine".to_string(),
            PathBuf::from("/dems/ant_200m.tif"),
        );
        ChainConfig {
            area: AreaSelection::AntarcticaOnly,
            resource_paths,
            ..ChainConfig::default()
        }
    }

    fn lrm_track() -> TrackData {
        TrackData {
            track_id: "G1".to_string(),
            instr_mode: InstrumentMode::Lrm,
            start_time: Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap(),
            lat_nadir: array![0.0],
            lon_nadir: array![0.0],
            altitude: array![ALT],
            tracker_range: array![ALT - 1000.0],
            geo_corrections: array![0.0],
            retracker_correction: array![0.0],
        }
    }

    fn upstream_context(hemisphere: Hemisphere, mode: InstrumentMode) -> Context {
        let mut ctx = Context::new();
        ctx.instr_mode = Some(mode);
        ctx.hemisphere = Some(hemisphere);
        ctx.corrected_range = Some(array![ALT - 1000.0]);
        ctx.measurements_to_include = Some(array![true]);
        ctx
    }

    #[test]
    fn test_relocates_and_writes_context_keys() {
        let broker = Arc::new(ResourceBroker::with_namespace(format!(
            "floe.gp{}",
            std::process::id()
        )));
        let mut stage = GeolocatePocaStage::with_loader(Arc::clone(&broker), synthetic_loader());
        stage.initialize(&south_config()).unwrap();

        let mut ctx = upstream_context(Hemisphere::South, InstrumentMode::Lrm);
        let outcome = stage.process(&lrm_track(), &mut ctx).unwrap();
        assert_eq!(outcome, StageOutcome::Completed);

        assert!(ctx.slope_ok.as_ref().unwrap()[0]);
        let height = ctx.height.as_ref().unwrap()[0];
        assert!((height - 1000.0).abs() < 1e-6);
        let lons = ctx.require_longitudes().unwrap();
        assert!((0.0..360.0).contains(&lons[0]));

        stage.finalize(FinalizeReason::RunComplete);
        assert_eq!(broker.resident(), 0);
    }

    #[test]
    fn test_non_lrm_track_skips_without_touching_context() {
        let broker = Arc::new(ResourceBroker::with_namespace(format!(
            "floe.gq{}",
            std::process::id()
        )));
        let mut stage = GeolocatePocaStage::with_loader(Arc::clone(&broker), synthetic_loader());
        stage.initialize(&south_config()).unwrap();

        let mut track = lrm_track();
        track.instr_mode = InstrumentMode::Sin;
        let mut ctx = upstream_context(Hemisphere::South, InstrumentMode::Sin);

        let outcome = stage.process(&track, &mut ctx).unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
        assert!(ctx.lat_poca.is_none());
        assert!(ctx.height.is_none());

        stage.finalize(FinalizeReason::RunComplete);
    }

    #[test]
    fn test_missing_upstream_keys_fail_the_unit() {
        let broker = Arc::new(ResourceBroker::with_namespace(format!(
            "floe.gr{}",
            std::process::id()
        )));
        let mut stage = GeolocatePocaStage::with_loader(Arc::clone(&broker), synthetic_loader());
        stage.initialize(&south_config()).unwrap();

        // No corrected range in the context
        let mut ctx = Context::new();
        ctx.instr_mode = Some(InstrumentMode::Lrm);
        ctx.hemisphere = Some(Hemisphere::South);
        ctx.measurements_to_include = Some(array![true]);

        let err = stage.process(&lrm_track(), &mut ctx).unwrap_err();
        assert!(matches!(err, ProcessError::MissingDependency("corrected_range")));

        stage.finalize(FinalizeReason::RunComplete);
    }

    #[test]
    fn test_missing_config_key_names_it() {
        let broker = Arc::new(ResourceBroker::with_namespace(format!(
            "floe.gs{}",
            std::process::id()
        )));
        let mut stage = GeolocatePocaStage::with_loader(Arc::clone(&broker), synthetic_loader());

        let mut config = south_config();
        config.resource_paths.remove("antarctic_dem_fine");
        let err = stage.initialize(&config).unwrap_err();
        assert!(err.to_string().contains("antarctic_dem_fine"));

        // Partial initialize acquired the coarse DEM; finalize releases it
        stage.finalize(FinalizeReason::StartupFailure);
        assert_eq!(broker.resident(), 0);
    }

    #[test]
    fn test_same_source_fine_grid_loads_once() {
        let broker = Arc::new(ResourceBroker::with_namespace(format!(
            "floe.gt{}",
            std::process::id()
        )));
        let mut stage = GeolocatePocaStage::with_loader(Arc::clone(&broker), synthetic_loader());
        stage.initialize(&south_config()).unwrap();

        // Coarse and fine share a source, so only one grid is resident
        assert_eq!(broker.resident(), 1);

        stage.finalize(FinalizeReason::RunComplete);
        assert_eq!(broker.resident(), 0);
    }
}
