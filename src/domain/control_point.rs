//! Ground control points and the transform families they can be fitted with.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NumericError;

/// How a control point was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointSource {
    /// Placed by a user.
    #[default]
    Manual,
    /// Proposed by a matcher and accepted by a user.
    Suggested,
}

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.longitude.is_finite() && self.latitude.is_finite()
    }

    /// True when the coordinate lies inside [-180, 180] x [-90, 90].
    pub fn is_in_range(&self) -> bool {
        self.is_finite()
            && (-180.0..=180.0).contains(&self.longitude)
            && (-90.0..=90.0).contains(&self.latitude)
    }
}

/// A correspondence between a pixel on the source raster and a known
/// geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    pub pixel_x: f64,
    pub pixel_y: f64,
    pub longitude: f64,
    pub latitude: f64,
    #[serde(default)]
    pub source: PointSource,
}

impl ControlPoint {
    /// A manually placed control point.
    pub fn new(pixel_x: f64, pixel_y: f64, longitude: f64, latitude: f64) -> Self {
        Self {
            pixel_x,
            pixel_y,
            longitude,
            latitude,
            source: PointSource::Manual,
        }
    }

    pub fn with_source(mut self, source: PointSource) -> Self {
        self.source = source;
        self
    }

    pub fn pixel(&self) -> [f64; 2] {
        [self.pixel_x, self.pixel_y]
    }

    pub fn geo(&self) -> GeoPoint {
        GeoPoint::new(self.longitude, self.latitude)
    }
}

/// Family of pixel → geographic transforms, in increasing flexibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformFamily {
    #[default]
    Affine,
    Polynomial {
        order: u8,
    },
    ThinPlateSpline,
    Projective,
}

impl TransformFamily {
    /// Highest polynomial order the solver accepts.
    pub const MAX_POLYNOMIAL_ORDER: u8 = 5;

    /// Number of monomials `x^i * y^j` with `i + j <= order`.
    pub fn monomial_count(order: u8) -> usize {
        let order = order as usize;
        (order + 1) * (order + 2) / 2
    }

    /// Fewest correspondences that determine a fit of this family.
    pub fn minimum_points(&self) -> usize {
        match self {
            TransformFamily::Affine => 3,
            TransformFamily::Polynomial { order } => Self::monomial_count(*order),
            TransformFamily::ThinPlateSpline => 4,
            TransformFamily::Projective => 4,
        }
    }

    /// Reject parameterisations the solver does not implement.
    pub fn check_supported(&self) -> Result<(), NumericError> {
        match self {
            TransformFamily::Polynomial { order }
                if *order == 0 || *order > Self::MAX_POLYNOMIAL_ORDER =>
            {
                Err(NumericError::UnsupportedFamily(format!(
                    "polynomial order {} (supported: 1..={})",
                    order,
                    Self::MAX_POLYNOMIAL_ORDER
                )))
            }
            _ => Ok(()),
        }
    }

    /// Low-cardinality label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TransformFamily::Affine => "affine",
            TransformFamily::Polynomial { .. } => "polynomial",
            TransformFamily::ThinPlateSpline => "thin_plate_spline",
            TransformFamily::Projective => "projective",
        }
    }
}

impl fmt::Display for TransformFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformFamily::Polynomial { order } => write!(f, "polynomial{}", order),
            other => f.write_str(other.label()),
        }
    }
}

impl FromStr for TransformFamily {
    type Err = NumericError;

    /// Parses `affine`, `projective` (or `homography`), `tps` (or
    /// `thin_plate_spline`), and `polynomialN` / `polynomial:N`. A bare
    /// `polynomial` means order 2.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let family = match normalized.as_str() {
            "affine" => TransformFamily::Affine,
            "projective" | "homography" => TransformFamily::Projective,
            "tps" | "thin_plate_spline" | "thinplatespline" => TransformFamily::ThinPlateSpline,
            "polynomial" => TransformFamily::Polynomial { order: 2 },
            other => {
                let order = other
                    .strip_prefix("polynomial")
                    .map(|rest| rest.trim_start_matches(':'))
                    .and_then(|rest| rest.parse::<u8>().ok())
                    .ok_or_else(|| NumericError::UnsupportedFamily(s.to_string()))?;
                TransformFamily::Polynomial { order }
            }
        };
        family.check_supported()?;
        Ok(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_points_per_family() {
        assert_eq!(TransformFamily::Affine.minimum_points(), 3);
        assert_eq!(TransformFamily::Projective.minimum_points(), 4);
        assert_eq!(TransformFamily::ThinPlateSpline.minimum_points(), 4);
        assert_eq!(TransformFamily::Polynomial { order: 1 }.minimum_points(), 3);
        assert_eq!(TransformFamily::Polynomial { order: 2 }.minimum_points(), 6);
        assert_eq!(TransformFamily::Polynomial { order: 3 }.minimum_points(), 10);
    }

    #[test]
    fn test_parse_family_names() {
        assert_eq!("affine".parse::<TransformFamily>(), Ok(TransformFamily::Affine));
        assert_eq!("TPS".parse::<TransformFamily>(), Ok(TransformFamily::ThinPlateSpline));
        assert_eq!("homography".parse::<TransformFamily>(), Ok(TransformFamily::Projective));
        assert_eq!(
            "polynomial:3".parse::<TransformFamily>(),
            Ok(TransformFamily::Polynomial { order: 3 })
        );
        assert_eq!(
            "polynomial2".parse::<TransformFamily>(),
            Ok(TransformFamily::Polynomial { order: 2 })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_out_of_range() {
        assert!(matches!(
            "bilinear".parse::<TransformFamily>(),
            Err(NumericError::UnsupportedFamily(_))
        ));
        assert!(matches!(
            "polynomial9".parse::<TransformFamily>(),
            Err(NumericError::UnsupportedFamily(_))
        ));
        assert!(matches!(
            "polynomial0".parse::<TransformFamily>(),
            Err(NumericError::UnsupportedFamily(_))
        ));
    }

    #[test]
    fn test_family_serde_shape() {
        let json = serde_json::to_value(TransformFamily::Polynomial { order: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "polynomial", "order": 2}));
        let parsed: TransformFamily = serde_json::from_value(serde_json::json!({"type": "affine"})).unwrap();
        assert_eq!(parsed, TransformFamily::Affine);
    }

    #[test]
    fn test_control_point_source_defaults_to_manual() {
        let point: ControlPoint = serde_json::from_value(serde_json::json!({
            "pixel_x": 1.0, "pixel_y": 2.0, "longitude": 3.0, "latitude": 4.0
        }))
        .unwrap();
        assert_eq!(point.source, PointSource::Manual);
    }
}
