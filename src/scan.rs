//! Layer-by-layer scan orchestration
//!
//! A scan lowers the object into the fluid one layer at a time and measures
//! the cumulative buoyancy at each depth. The first difference of those
//! readings is the volume newly submerged per layer.
//!
//! `layer_count` layers need `layer_count + 1` measurements: depth zero plus
//! one per layer boundary.

use crate::error::{ScanResult, ScannerError};
use crate::geometry;
use crate::protocol::Scanner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// Largest step position the controller's 32-bit axis counter can reach.
const MAX_AXIS_STEPS: f64 = i32::MAX as f64;

/// Volume-by-height profile produced by one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProfile {
    /// Volume added between height step `i` and `i + 1`
    pub volumes: Vec<f64>,
    /// Height of step `i`, in length units
    pub heights: Vec<f64>,
    /// Layer height the scan was run with, in length units
    pub layer_height: f64,
    /// When the last layer was measured
    pub captured_at: DateTime<Utc>,
}

impl ScanProfile {
    /// Build a profile from cumulative layer averages and the step positions
    /// they were taken at.
    ///
    /// `measures` and `step_heights` hold one entry per measurement
    /// (`layer_count + 1`); the profile has one entry fewer.
    pub fn from_measurements(
        measures: &[f64],
        step_heights: &[f64],
        steps_per_unit: f64,
        layer_height: f64,
    ) -> ScanResult<Self> {
        if measures.len() != step_heights.len() {
            return Err(ScannerError::InvalidArgument(format!(
                "{} measurements but {} step heights",
                measures.len(),
                step_heights.len()
            )));
        }
        if measures.len() < 2 {
            return Err(ScannerError::InvalidArgument(
                "a profile needs at least two measurements".to_string(),
            ));
        }

        let volumes = measures.windows(2).map(|pair| pair[1] - pair[0]).collect();
        let heights = step_heights[..step_heights.len() - 1]
            .iter()
            .map(|steps| steps / steps_per_unit)
            .collect();

        Ok(Self {
            volumes,
            heights,
            layer_height,
            captured_at: Utc::now(),
        })
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Whether the profile has no layers.
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Equivalent-cylinder radius per layer.
    pub fn radii(&self) -> ScanResult<Vec<f64>> {
        geometry::layer_radii(&self.volumes, &self.heights)
    }

    /// Total scanned volume.
    pub fn total_volume(&self) -> f64 {
        self.volumes.iter().sum()
    }
}

impl Scanner {
    /// Scan `layer_count` layers of `layer_height` each, measuring every
    /// layer with `averages` raw samples.
    ///
    /// The motor is energized only while moving; each layer is measured
    /// with the motor off.
    #[instrument(skip(self), fields(transport = self.transport_kind()), err)]
    pub async fn scan(
        &mut self,
        layer_height: f64,
        layer_count: u32,
        averages: u32,
    ) -> ScanResult<ScanProfile> {
        if layer_count == 0 {
            return Err(ScannerError::InvalidArgument(
                "layer_count must be > 0".to_string(),
            ));
        }
        if !layer_height.is_finite() || layer_height <= 0.0 {
            return Err(ScannerError::InvalidArgument(format!(
                "layer_height must be positive, got {}",
                layer_height
            )));
        }
        if averages == 0 {
            return Err(ScannerError::InvalidArgument(
                "averages must be > 0".to_string(),
            ));
        }

        let steps_per_unit = self.calibration.steps_per_unit;
        let layer_height_steps = layer_height * steps_per_unit;
        let deepest = f64::from(layer_count) * layer_height_steps;
        if deepest > MAX_AXIS_STEPS {
            return Err(ScannerError::InvalidArgument(format!(
                "scan depth of {} steps exceeds the axis range of {} steps",
                deepest, MAX_AXIS_STEPS
            )));
        }
        info!(layer_count, layer_height_steps, "Starting scan");

        self.set_motor_on().await?;
        self.move_to(0.0).await?;
        self.set_axis_home().await?;

        let mut measures = Vec::new();
        let mut step_heights = Vec::new();
        for layer in 0..=layer_count {
            let depth = f64::from(layer) * layer_height_steps;

            self.set_motor_on().await?;
            self.move_to(-depth).await?;
            self.set_motor_off().await?;

            let result = self.measure_and_filter(averages).await?;
            info!(
                layer,
                of = layer_count,
                average = result.average,
                "Layer measured"
            );
            measures.push(result.average);
            step_heights.push(depth);
        }

        let profile =
            ScanProfile::from_measurements(&measures, &step_heights, steps_per_unit, layer_height)?;
        info!(
            layers = profile.len(),
            total_volume = profile.total_volume(),
            "Scan complete"
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_difference() {
        let profile = ScanProfile::from_measurements(
            &[0.0, 10.0, 25.0, 45.0],
            &[0.0, 4.0, 8.0, 12.0],
            2.0,
            2.0,
        )
        .unwrap();
        assert_eq!(profile.volumes, vec![10.0, 15.0, 20.0]);
        assert_eq!(profile.heights, vec![0.0, 2.0, 4.0]);
        assert_eq!(profile.len(), 3);
        assert_eq!(profile.total_volume(), 45.0);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        assert!(ScanProfile::from_measurements(&[0.0, 1.0], &[0.0], 1.0, 1.0).is_err());
        assert!(ScanProfile::from_measurements(&[0.0], &[0.0], 1.0, 1.0).is_err());
    }

    #[test]
    fn test_profile_serializes() {
        let profile =
            ScanProfile::from_measurements(&[0.0, 1.5], &[0.0, 1.0], 1.0, 1.0).unwrap();
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["volumes"][0], 1.5);
        assert!(json["captured_at"].is_string());
    }
}
