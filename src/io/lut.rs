//! Slope-to-uncertainty lookup-table files.
//!
//! The table is pre-generated offline from binned elevation differences
//! against a reference mission and shipped as a small raw little-endian
//! binary: an ASCII magic, the slope-bin metadata, then one uncertainty
//! value per bin. Reading validates the content the way the chain validates
//! reference grids: a malformed table is a startup failure, not something
//! to limp along with.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::types::{ResourceError, ResourceResult};

const LUT_MAGIC: &[u8; 4] = b"FLUT";

/// 1D lookup table mapping surface slope to empirical elevation uncertainty
#[derive(Debug, Clone)]
pub struct UncertaintyTable {
    min_slope: f64,
    max_slope: f64,
    values: Vec<f64>,
}

impl UncertaintyTable {
    /// Build a table directly from bin values (used by table tooling and tests)
    pub fn from_values(min_slope: f64, max_slope: f64, values: Vec<f64>) -> ResourceResult<Self> {
        if values.len() < 2 {
            return Err(ResourceError::Validation(format!(
                "uncertainty table needs at least 2 bins, got {}",
                values.len()
            )));
        }
        if !(max_slope > min_slope) {
            return Err(ResourceError::Validation(format!(
                "uncertainty table slope range is empty: {} .. {}",
                min_slope, max_slope
            )));
        }
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ResourceError::Validation(
                "uncertainty table contains negative or non-finite bins".to_string(),
            ));
        }
        Ok(Self {
            min_slope,
            max_slope,
            values,
        })
    }

    /// Read a table from its on-disk binary form
    pub fn from_file<P: AsRef<Path>>(path: P) -> ResourceResult<Self> {
        let path = path.as_ref();
        log::info!("loading uncertainty table from {}", path.display());
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LUT_MAGIC {
            return Err(ResourceError::Validation(format!(
                "{} is not an uncertainty table (bad magic)",
                path.display()
            )));
        }

        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let number_of_bins = u32::from_le_bytes(buf4) as usize;
        if number_of_bins < 2 || number_of_bins > 1_000_000 {
            return Err(ResourceError::Validation(format!(
                "implausible uncertainty table bin count {}",
                number_of_bins
            )));
        }

        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf8)?;
        let min_slope = f64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let max_slope = f64::from_le_bytes(buf8);

        let mut values = Vec::with_capacity(number_of_bins);
        for _ in 0..number_of_bins {
            reader.read_exact(&mut buf8)?;
            values.push(f64::from_le_bytes(buf8));
        }

        Self::from_values(min_slope, max_slope, values)
    }

    /// Write the on-disk binary form (table construction tooling lives
    /// outside the chain; this is the one format both sides agree on)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(LUT_MAGIC)?;
        writer.write_all(&(self.values.len() as u32).to_le_bytes())?;
        writer.write_all(&self.min_slope.to_le_bytes())?;
        writer.write_all(&self.max_slope.to_le_bytes())?;
        for v in &self.values {
            writer.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn number_of_bins(&self) -> usize {
        self.values.len()
    }

    /// Uncertainty for one slope value; slopes outside the table's range
    /// clamp to the edge bins, NaN slope gives NaN uncertainty
    pub fn lookup(&self, slope: f64) -> f64 {
        if slope.is_nan() {
            return f64::NAN;
        }
        let span = self.max_slope - self.min_slope;
        let frac = (slope - self.min_slope) / span;
        let idx = (frac * self.values.len() as f64).floor();
        let idx = (idx.max(0.0) as usize).min(self.values.len() - 1);
        self.values[idx]
    }
}
