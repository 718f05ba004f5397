//! Elevation-uncertainty stage.
//!
//! Looks up the surface slope at each final (POCA or nadir) coordinate and
//! maps it through a pre-generated slope-to-uncertainty table, one table
//! and slope grid per hemisphere.

use std::path::Path;
use std::sync::Arc;

use crate::chain::config::{ChainConfig, UncertaintyConfig};
use crate::chain::context::Context;
use crate::chain::stage::{FinalizeReason, Stage, StageOutcome};
use crate::geo::{PolarStereo, Projection};
use crate::io::{self, UncertaintyTable};
use crate::resources::{GridHandle, ResourceBroker};
use crate::track::TrackData;
use crate::types::{Hemisphere, InitError, InitResult, ProcessError, ProcessResult};

use super::geolocate_poca::GridLoader;

/// Stage attaching an empirical elevation uncertainty to every measurement
pub struct UncertaintyStage {
    broker: Arc<ResourceBroker>,
    loader: Arc<GridLoader>,
    settings: Option<UncertaintyConfig>,
    slopes_south: Option<GridHandle>,
    slopes_north: Option<GridHandle>,
    table_south: Option<UncertaintyTable>,
    table_north: Option<UncertaintyTable>,
}

impl UncertaintyStage {
    pub fn new(broker: Arc<ResourceBroker>) -> Self {
        Self::with_loader(
            broker,
            Arc::new(|path: &Path, projection: Projection| io::dem::load_geotiff(path, projection)),
        )
    }

    pub fn with_loader(broker: Arc<ResourceBroker>, loader: Arc<GridLoader>) -> Self {
        Self {
            broker,
            loader,
            settings: None,
            slopes_south: None,
            slopes_north: None,
            table_south: None,
            table_north: None,
        }
    }

    fn acquire_hemisphere(
        &mut self,
        config: &ChainConfig,
        hemisphere: Hemisphere,
    ) -> InitResult<()> {
        let (slope_key, table_key, projection) = match hemisphere {
            Hemisphere::South => (
                "antarctic_slopes",
                "antarctic_uncertainty_table",
                Projection::PolarStereo(PolarStereo::south()),
            ),
            Hemisphere::North => (
                "greenland_slopes",
                "greenland_uncertainty_table",
                Projection::PolarStereo(PolarStereo::north()),
            ),
        };

        let slope_path = config.require_path(slope_key)?.to_path_buf();
        let loader = Arc::clone(&self.loader);
        let load_path = slope_path.clone();
        let slopes = self.broker.acquire_with(
            slope_key,
            &slope_path.to_string_lossy(),
            config.use_shared_memory,
            move || loader(&load_path, projection),
        )?;
        // Stored before the table loads so a failed table still releases
        // the slope grid in finalize
        match hemisphere {
            Hemisphere::South => self.slopes_south = Some(slopes),
            Hemisphere::North => self.slopes_north = Some(slopes),
        }

        let table_path = config.require_path(table_key)?;
        let table = UncertaintyTable::from_file(table_path).map_err(InitError::Resource)?;
        log::info!(
            "loaded {} with {} slope bins",
            table_key,
            table.number_of_bins()
        );
        match hemisphere {
            Hemisphere::South => self.table_south = Some(table),
            Hemisphere::North => self.table_north = Some(table),
        }
        Ok(())
    }
}

impl Stage for UncertaintyStage {
    fn name(&self) -> &str {
        "uncertainty"
    }

    fn initialize(&mut self, config: &ChainConfig) -> InitResult<()> {
        if config.area.wants_south() {
            self.acquire_hemisphere(config, Hemisphere::South)?;
        }
        if config.area.wants_north() {
            self.acquire_hemisphere(config, Hemisphere::North)?;
        }
        self.settings = Some(config.uncertainty.clone());
        Ok(())
    }

    fn process(&mut self, track: &TrackData, context: &mut Context) -> ProcessResult<StageOutcome> {
        let Some(settings) = self.settings.clone() else {
            return Err(ProcessError::InvalidInput(
                "uncertainty processed before initialize".to_string(),
            ));
        };

        let hemisphere = context.require_hemisphere()?;
        let (slopes, table) = match hemisphere {
            Hemisphere::South => (&self.slopes_south, &self.table_south),
            Hemisphere::North => (&self.slopes_north, &self.table_north),
        };
        let (Some(slopes), Some(table)) = (slopes.as_ref(), table.as_ref()) else {
            return Err(ProcessError::InvalidInput(format!(
                "no {} hemisphere slope data loaded",
                hemisphere
            )));
        };

        let slope_values = {
            let latitudes = context.require_latitudes()?;
            let longitudes = context.require_longitudes()?;
            slopes.interpolate(latitudes, longitudes)
        };

        let uncertainty = slope_values.mapv(|slope| {
            let u = table.lookup(slope);
            u.clamp(settings.min_uncertainty, settings.max_uncertainty)
        });

        let finite = uncertainty.iter().filter(|u| u.is_finite()).count();
        log::info!(
            "[{}] uncertainty assigned for {} of {} measurements",
            track.track_id,
            finite,
            uncertainty.len()
        );

        context.uncertainty = Some(uncertainty);
        Ok(StageOutcome::Completed)
    }

    fn finalize(&mut self, reason: FinalizeReason) {
        log::debug!("finalize uncertainty ({:?})", reason);
        for handle in [self.slopes_south.take(), self.slopes_north.take()]
            .into_iter()
            .flatten()
        {
            self.broker.release(handle);
        }
        self.table_south = None;
        self.table_north = None;
    }
}
