//! Georeferencing transform engine.
//!
//! Everything in this module is synchronous and side-effect free apart from
//! logging. The pipeline for one fit is:
//!
//! 1. [`validate::validate`] rejects point sets that cannot determine the family
//! 2. [`solver::fit_with_tolerance`] solves for the parameters
//! 3. [`accuracy::AccuracyReport::evaluate`] measures residuals in metres
//! 4. [`bounds::document_bounds`] derives the geographic extent
//!
//! [`fit_control_points`] runs all four.

pub mod accuracy;
pub mod bounds;
pub mod solver;
pub mod transform;
pub mod validate;

use serde::{Deserialize, Serialize};

use crate::domain::control_point::{ControlPoint, TransformFamily};
use crate::error::{Result, ValidationError};

pub use accuracy::AccuracyReport;
pub use bounds::GeoBounds;
pub use transform::FittedTransform;

/// Tolerances for validation and solving.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Largest accepted condition number of the normalized design matrix.
    pub max_condition_number: f64,
    /// Control pixels closer than this (in pixels) count as coincident.
    pub coincidence_tolerance_px: f64,
    /// Relative pivot below which the solve reports a singular system.
    pub pivot_tolerance: f64,
    /// Highest polynomial order accepted, at most
    /// [`TransformFamily::MAX_POLYNOMIAL_ORDER`].
    pub max_polynomial_order: u8,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_condition_number: 1e8,
            coincidence_tolerance_px: 1e-6,
            pivot_tolerance: solver::DEFAULT_PIVOT_TOLERANCE,
            max_polynomial_order: TransformFamily::MAX_POLYNOMIAL_ORDER,
        }
    }
}

/// Result of fitting a point set: the transform plus what was derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    pub transform: FittedTransform,
    pub accuracy: AccuracyReport,
    pub bounds: GeoBounds,
}

/// Validate, solve, score and bound in one step.
pub fn fit_control_points(
    points: &[ControlPoint],
    family: TransformFamily,
    raster_size: Option<(u32, u32)>,
    config: &FitConfig,
) -> Result<FitOutcome> {
    validate::validate(points, family, config)?;
    let transform = solver::fit_with_tolerance(points, family, config.pivot_tolerance)?;
    derive(transform, points, raster_size)
}

/// Recompute the accuracy report and bounds of an existing transform.
pub fn derive(
    transform: FittedTransform,
    points: &[ControlPoint],
    raster_size: Option<(u32, u32)>,
) -> Result<FitOutcome> {
    let accuracy = AccuracyReport::evaluate(&transform, points);
    let bounds = bounds::document_bounds(&transform, points, raster_size).ok_or_else(|| {
        ValidationError::DegenerateGeometry {
            detail: "fit produced no finite geographic extent".to_string(),
            condition_number: None,
        }
    })?;
    Ok(FitOutcome {
        transform,
        accuracy,
        bounds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GeoreferenceError;
    use crate::geometry::solver::tests::scenario_points;

    #[test]
    fn test_scenario_end_to_end() {
        let outcome = fit_control_points(
            &scenario_points(),
            TransformFamily::Affine,
            None,
            &FitConfig::default(),
        )
        .unwrap();
        assert!(outcome.accuracy.rmse_meters < 1e-3);
        let p = outcome.transform.apply(50.0, 50.0);
        assert!((p.longitude - -121.9995).abs() < 1e-9);
        assert!((p.latitude - 37.0005).abs() < 1e-9);
        assert!(outcome.bounds.north >= outcome.bounds.south);
        assert!(outcome.bounds.east >= outcome.bounds.west);
    }

    #[test]
    fn test_collinear_scenario_is_degenerate() {
        let points = vec![
            ControlPoint::new(0.0, 0.0, -122.0, 37.0),
            ControlPoint::new(10.0, 0.0, -121.9999, 37.0),
            ControlPoint::new(20.0, 0.0, -121.9998, 37.0),
        ];
        let err = fit_control_points(&points, TransformFamily::Affine, None, &FitConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            GeoreferenceError::Validation(ValidationError::DegenerateGeometry { .. })
        ));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: FitConfig =
            serde_json::from_value(serde_json::json!({"max_condition_number": 1e6})).unwrap();
        assert_eq!(config.max_condition_number, 1e6);
        assert_eq!(config.max_polynomial_order, 5);
    }
}
