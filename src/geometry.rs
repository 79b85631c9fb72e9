//! Equivalent-cylinder geometry
//!
//! Each layer is modelled as a right cylinder whose height is the uniform
//! layer step and whose volume is the measured layer volume.

use crate::error::{ScanResult, ScannerError};
use std::f64::consts::PI;

/// Radius of the cylinder of height `step` holding `volume`.
///
/// Negative volumes (buoyancy lost between layers) use their magnitude.
pub fn cylinder_radius(volume: f64, step: f64) -> f64 {
    (volume / (step * PI)).abs().sqrt()
}

/// Equivalent radius for every layer of a `(volumes, heights)` profile.
///
/// The step is `heights[1] - heights[0]`, so at least two heights are
/// required.
pub fn layer_radii(volumes: &[f64], heights: &[f64]) -> ScanResult<Vec<f64>> {
    let [first, second, ..] = heights else {
        return Err(ScannerError::InvalidArgument(format!(
            "radius derivation needs at least two heights, got {}",
            heights.len()
        )));
    };
    let step = second - first;
    if step == 0.0 || !step.is_finite() {
        return Err(ScannerError::InvalidArgument(format!(
            "layer step must be non-zero, got {}",
            step
        )));
    }

    Ok(volumes.iter().map(|&v| cylinder_radius(v, step)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_of_known_cylinder() {
        let radius = 0.02;
        let step = 0.01;
        let volume = PI * radius * radius * step;
        let radii = layer_radii(&[volume, 0.0, -volume], &[0.0, step, 2.0 * step]).unwrap();
        assert!((radii[0] - radius).abs() < 1e-12);
        assert_eq!(radii[1], 0.0);
        assert!((radii[2] - radius).abs() < 1e-12);
    }

    #[test]
    fn test_needs_two_heights() {
        assert!(layer_radii(&[1.0], &[0.0]).is_err());
        assert!(layer_radii(&[], &[]).is_err());
        assert!(layer_radii(&[1.0, 1.0], &[2.0, 2.0]).is_err());
    }
}
