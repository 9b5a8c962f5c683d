//! Ground-distance accuracy of a fitted transform.

use serde::{Deserialize, Serialize};

use crate::domain::control_point::{ControlPoint, GeoPoint};
use crate::geometry::transform::FittedTransform;

/// Mean Earth radius (IUGG), in metres.
pub const EARTH_MEAN_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance between two WGS84 points on a spherical Earth.
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_MEAN_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Residuals of a fit measured back at its own control points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub rmse_meters: f64,
    pub per_point_residuals_meters: Vec<f64>,
    pub point_count: usize,
}

impl AccuracyReport {
    /// Apply `transform` to every control pixel and compare against the
    /// supplied coordinate. A prediction that is not finite (a pixel on a
    /// homography's line at infinity) has infinite residual.
    pub fn evaluate(transform: &FittedTransform, points: &[ControlPoint]) -> Self {
        let per_point_residuals_meters: Vec<f64> = points
            .iter()
            .map(|point| {
                let predicted = transform.apply(point.pixel_x, point.pixel_y);
                if predicted.is_finite() {
                    haversine_meters(predicted, point.geo())
                } else {
                    f64::INFINITY
                }
            })
            .collect();

        let point_count = per_point_residuals_meters.len();
        let rmse_meters = if point_count == 0 {
            0.0
        } else {
            (per_point_residuals_meters.iter().map(|r| r * r).sum::<f64>() / point_count as f64)
                .sqrt()
        };

        Self {
            rmse_meters,
            per_point_residuals_meters,
            point_count,
        }
    }

    pub fn max_residual_meters(&self) -> f64 {
        self.per_point_residuals_meters
            .iter()
            .copied()
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::control_point::TransformFamily;
    use crate::geometry::solver::{fit, tests::scenario_points};
    use crate::geometry::transform::AffineParams;

    #[test]
    fn test_haversine_known_distances() {
        // One degree of longitude on the equator.
        let d = haversine_meters(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111_195.08).abs() < 0.1, "{d}");
        assert_eq!(haversine_meters(GeoPoint::new(5.0, 5.0), GeoPoint::new(5.0, 5.0)), 0.0);
        let antipodal = haversine_meters(GeoPoint::new(0.0, 0.0), GeoPoint::new(180.0, 0.0));
        assert!((antipodal - std::f64::consts::PI * EARTH_MEAN_RADIUS_METERS).abs() < 1e-6);
    }

    #[test]
    fn test_exact_fit_has_zero_rmse() {
        let points = scenario_points();
        let t = fit(&points, TransformFamily::Affine).unwrap();
        let report = AccuracyReport::evaluate(&t, &points);
        assert_eq!(report.point_count, 3);
        assert!(report.rmse_meters < 1e-3, "{}", report.rmse_meters);
    }

    #[test]
    fn test_rmse_is_root_mean_square() {
        // Identity-ish transform that is off by 0.001 degrees of latitude at
        // one point and exact at the other.
        let t = FittedTransform::Affine(AffineParams {
            longitude: [1.0, 0.0, 0.0],
            latitude: [0.0, 1.0, 0.0],
        });
        let points = vec![
            ControlPoint::new(10.0, 20.0, 10.0, 20.0),
            ControlPoint::new(10.0, 20.0, 10.0, 20.001),
        ];
        let report = AccuracyReport::evaluate(&t, &points);
        let offset = report.per_point_residuals_meters[1];
        assert_eq!(report.per_point_residuals_meters[0], 0.0);
        assert!((offset - 111.195).abs() < 0.01, "{offset}");
        assert!((report.rmse_meters - offset / 2f64.sqrt()).abs() < 1e-9);
        assert_eq!(report.max_residual_meters(), offset);
    }
}
