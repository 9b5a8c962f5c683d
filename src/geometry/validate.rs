//! Control point validation, run before any numeric work.

use crate::domain::control_point::{ControlPoint, TransformFamily};
use crate::error::{NumericError, Result, ValidationError};
use crate::geometry::FitConfig;
use crate::geometry::solver::design_matrix;

/// Check that `points` can determine a fit of `family`.
///
/// Checks run in a fixed order so that a short point list always reports
/// `InsufficientPoints`, whatever its geometry:
/// family support, point count, coordinate finiteness and range, coincident
/// pixels, then conditioning of the solver's design matrix.
pub fn validate(points: &[ControlPoint], family: TransformFamily, config: &FitConfig) -> Result<()> {
    family.check_supported()?;
    if let TransformFamily::Polynomial { order } = family {
        if order > config.max_polynomial_order {
            return Err(NumericError::UnsupportedFamily(format!(
                "polynomial order {} exceeds configured maximum {}",
                order, config.max_polynomial_order
            ))
            .into());
        }
    }

    let required = family.minimum_points();
    if points.len() < required {
        return Err(ValidationError::InsufficientPoints {
            family,
            required,
            provided: points.len(),
        }
        .into());
    }

    for (index, point) in points.iter().enumerate() {
        if !point.pixel_x.is_finite() || !point.pixel_y.is_finite() {
            return Err(ValidationError::NonFinitePixel { index }.into());
        }
        if !point.geo().is_in_range() {
            return Err(ValidationError::OutOfRangeCoordinate {
                index,
                longitude: point.longitude,
                latitude: point.latitude,
            }
            .into());
        }
    }

    if let Some((first, second)) = coincident_pair(points, config.coincidence_tolerance_px) {
        return Err(ValidationError::DegenerateGeometry {
            detail: format!("control points {first} and {second} share the same pixel position"),
            condition_number: None,
        }
        .into());
    }

    let condition = condition_number(points, family);
    if !condition.is_finite() || condition > config.max_condition_number {
        tracing::debug!(
            %family,
            condition_number = condition,
            threshold = config.max_condition_number,
            "Design matrix is ill-conditioned"
        );
        return Err(ValidationError::DegenerateGeometry {
            detail: format!(
                "control points are too close to collinear for {family} (condition number {condition:.3e})"
            ),
            condition_number: condition.is_finite().then_some(condition),
        }
        .into());
    }

    Ok(())
}

/// Ratio of largest to smallest singular value of the normalized design
/// matrix. Infinite when the matrix is rank deficient.
pub fn condition_number(points: &[ControlPoint], family: TransformFamily) -> f64 {
    let a = design_matrix(points, family);
    if a.nrows() < a.ncols() {
        return f64::INFINITY;
    }
    let singular = a.svd(false, false).singular_values;
    let max = singular.max();
    let min = singular.min();
    if min <= 0.0 || !min.is_finite() {
        f64::INFINITY
    } else {
        max / min
    }
}

fn coincident_pair(points: &[ControlPoint], tolerance: f64) -> Option<(usize, usize)> {
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let dx = points[i].pixel_x - points[j].pixel_x;
            let dy = points[i].pixel_y - points[j].pixel_y;
            if dx.hypot(dy) <= tolerance {
                return Some((i, j));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GeoreferenceError;
    use crate::geometry::solver::tests::scenario_points;

    fn config() -> FitConfig {
        FitConfig::default()
    }

    #[test]
    fn test_minimum_minus_one_is_always_insufficient() {
        let families = [
            TransformFamily::Affine,
            TransformFamily::Projective,
            TransformFamily::ThinPlateSpline,
            TransformFamily::Polynomial { order: 2 },
            TransformFamily::Polynomial { order: 3 },
        ];
        for family in families {
            let required = family.minimum_points();
            // Deliberately degenerate: every point identical.
            let points = vec![ControlPoint::new(1.0, 1.0, 1.0, 1.0); required - 1];
            let err = validate(&points, family, &config()).unwrap_err();
            assert!(
                matches!(
                    err,
                    GeoreferenceError::Validation(ValidationError::InsufficientPoints {
                        required: r,
                        provided: p,
                        ..
                    }) if r == required && p == required - 1
                ),
                "{family}: {err:?}"
            );
        }
    }

    #[test]
    fn test_two_points_affine_insufficient() {
        let points = &scenario_points()[..2];
        assert!(matches!(
            validate(points, TransformFamily::Affine, &config()),
            Err(GeoreferenceError::Validation(ValidationError::InsufficientPoints { .. }))
        ));
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let points = vec![
            ControlPoint::new(0.0, 0.0, -122.0, 37.0),
            ControlPoint::new(50.0, 50.0, -121.9995, 37.0005),
            ControlPoint::new(100.0, 100.0, -121.999, 37.001),
        ];
        let err = validate(&points, TransformFamily::Affine, &config()).unwrap_err();
        assert!(matches!(
            err,
            GeoreferenceError::Validation(ValidationError::DegenerateGeometry { .. })
        ));
    }

    #[test]
    fn test_coincident_pixels_are_degenerate() {
        let mut points = scenario_points();
        points.push(ControlPoint::new(0.0, 0.0, -121.5, 37.5));
        let err = validate(&points, TransformFamily::Affine, &config()).unwrap_err();
        match err {
            GeoreferenceError::Validation(ValidationError::DegenerateGeometry {
                condition_number,
                detail,
            }) => {
                assert!(condition_number.is_none());
                assert!(detail.contains("0 and 3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_coordinates() {
        let mut points = scenario_points();
        points[1].latitude = 91.0;
        assert!(matches!(
            validate(&points, TransformFamily::Affine, &config()),
            Err(GeoreferenceError::Validation(ValidationError::OutOfRangeCoordinate { index: 1, .. }))
        ));

        let mut points = scenario_points();
        points[2].longitude = f64::NAN;
        assert!(matches!(
            validate(&points, TransformFamily::Affine, &config()),
            Err(GeoreferenceError::Validation(ValidationError::OutOfRangeCoordinate { index: 2, .. }))
        ));
    }

    #[test]
    fn test_non_finite_pixel() {
        let mut points = scenario_points();
        points[0].pixel_x = f64::INFINITY;
        assert!(matches!(
            validate(&points, TransformFamily::Affine, &config()),
            Err(GeoreferenceError::Validation(ValidationError::NonFinitePixel { index: 0 }))
        ));
    }

    #[test]
    fn test_scenario_points_are_valid() {
        validate(&scenario_points(), TransformFamily::Affine, &config()).unwrap();
        assert!(condition_number(&scenario_points(), TransformFamily::Affine) < 10.0);
    }

    #[test]
    fn test_configured_polynomial_ceiling() {
        let config = FitConfig {
            max_polynomial_order: 2,
            ..FitConfig::default()
        };
        assert!(matches!(
            validate(&scenario_points(), TransformFamily::Polynomial { order: 3 }, &config),
            Err(GeoreferenceError::Numeric(NumericError::UnsupportedFamily(_)))
        ));
    }
}
