//! Fitted transform parameter sets and their forward application.

use serde::{Deserialize, Serialize};

use crate::domain::control_point::{GeoPoint, TransformFamily};

/// Similarity that moves a point set's centroid to the origin and scales it
/// so the mean distance from the origin is sqrt(2).
///
/// Polynomial and thin plate spline fits are solved (and applied) in this
/// frame to keep their systems well conditioned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub center_x: f64,
    pub center_y: f64,
    pub scale: f64,
}

impl Normalization {
    pub fn identity() -> Self {
        Self {
            center_x: 0.0,
            center_y: 0.0,
            scale: 1.0,
        }
    }

    pub fn from_points(points: &[[f64; 2]]) -> Self {
        if points.is_empty() {
            return Self::identity();
        }
        let n = points.len() as f64;
        let center_x = points.iter().map(|p| p[0]).sum::<f64>() / n;
        let center_y = points.iter().map(|p| p[1]).sum::<f64>() / n;
        let mean_dist = points
            .iter()
            .map(|p| ((p[0] - center_x).powi(2) + (p[1] - center_y).powi(2)).sqrt())
            .sum::<f64>()
            / n;
        let scale = if mean_dist > 1e-15 {
            std::f64::consts::SQRT_2 / mean_dist
        } else {
            1.0
        };
        Self {
            center_x,
            center_y,
            scale,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> [f64; 2] {
        [
            (x - self.center_x) * self.scale,
            (y - self.center_y) * self.scale,
        ]
    }

    /// Inverse mapping: normalized → original frame.
    pub fn invert(&self, u: f64, v: f64) -> [f64; 2] {
        [u / self.scale + self.center_x, v / self.scale + self.center_y]
    }
}

/// `lon = c0*x + c1*y + c2`, `lat = d0*x + d1*y + d2` in raw pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineParams {
    pub longitude: [f64; 3],
    pub latitude: [f64; 3],
}

/// Homography with `h33` fixed to 1, stored row-major as
/// `[h11, h12, h13, h21, h22, h23, h31, h32]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectiveParams {
    pub coefficients: [f64; 8],
}

impl ProjectiveParams {
    /// Homogeneous scale `w = h31*x + h32*y + 1`. Pixels where it is zero
    /// lie on the line at infinity.
    pub fn denominator(&self, x: f64, y: f64) -> f64 {
        self.coefficients[6] * x + self.coefficients[7] * y + 1.0
    }
}

/// Coefficients over the monomials of the normalized pixel coordinates, in
/// the order produced by [`monomials`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialParams {
    pub order: u8,
    pub normalization: Normalization,
    pub longitude: Vec<f64>,
    pub latitude: Vec<f64>,
}

/// One output axis of a thin plate spline: kernel weights per control point
/// plus the affine part `a0 + a1*u + a2*v`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineAxis {
    pub weights: Vec<f64>,
    pub affine: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinPlateSplineParams {
    pub normalization: Normalization,
    /// Control pixels in the normalized frame.
    pub control: Vec<[f64; 2]>,
    pub longitude: SplineAxis,
    pub latitude: SplineAxis,
}

/// A fitted pixel → geographic transform. The payload shape depends on the
/// family tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", content = "parameters", rename_all = "snake_case")]
pub enum FittedTransform {
    Affine(AffineParams),
    Polynomial(PolynomialParams),
    ThinPlateSpline(ThinPlateSplineParams),
    Projective(ProjectiveParams),
}

impl FittedTransform {
    pub fn family(&self) -> TransformFamily {
        match self {
            FittedTransform::Affine(_) => TransformFamily::Affine,
            FittedTransform::Polynomial(p) => TransformFamily::Polynomial { order: p.order },
            FittedTransform::ThinPlateSpline(_) => TransformFamily::ThinPlateSpline,
            FittedTransform::Projective(_) => TransformFamily::Projective,
        }
    }

    /// Map a pixel coordinate to a geographic coordinate.
    ///
    /// Projective transforms return NaN coordinates for pixels on the line at
    /// infinity.
    pub fn apply(&self, x: f64, y: f64) -> GeoPoint {
        match self {
            FittedTransform::Affine(p) => GeoPoint::new(
                p.longitude[0] * x + p.longitude[1] * y + p.longitude[2],
                p.latitude[0] * x + p.latitude[1] * y + p.latitude[2],
            ),
            FittedTransform::Projective(p) => {
                let h = &p.coefficients;
                let w = p.denominator(x, y);
                if w.abs() < 1e-15 {
                    return GeoPoint::new(f64::NAN, f64::NAN);
                }
                GeoPoint::new(
                    (h[0] * x + h[1] * y + h[2]) / w,
                    (h[3] * x + h[4] * y + h[5]) / w,
                )
            }
            FittedTransform::Polynomial(p) => {
                let [u, v] = p.normalization.apply(x, y);
                let terms = monomials(p.order, u, v);
                GeoPoint::new(dot(&p.longitude, &terms), dot(&p.latitude, &terms))
            }
            FittedTransform::ThinPlateSpline(p) => {
                let [u, v] = p.normalization.apply(x, y);
                let kernel: Vec<f64> = p
                    .control
                    .iter()
                    .map(|c| radial_basis((u - c[0]).powi(2) + (v - c[1]).powi(2)))
                    .collect();
                let eval = |axis: &SplineAxis| {
                    axis.affine[0] + axis.affine[1] * u + axis.affine[2] * v
                        + dot(&axis.weights, &kernel)
                };
                GeoPoint::new(eval(&p.longitude), eval(&p.latitude))
            }
        }
    }

    pub fn apply_pixel(&self, pixel: [f64; 2]) -> GeoPoint {
        self.apply(pixel[0], pixel[1])
    }
}

/// All monomials `u^i * v^j` with `i + j <= order`, grouped by total degree
/// and with descending powers of `u` inside each degree:
/// `1, u, v, u², uv, v², ...`.
pub fn monomials(order: u8, u: f64, v: f64) -> Vec<f64> {
    let mut terms = Vec::with_capacity(TransformFamily::monomial_count(order));
    for degree in 0..=order as i32 {
        for i in (0..=degree).rev() {
            terms.push(u.powi(i) * v.powi(degree - i));
        }
    }
    terms
}

/// Thin plate spline kernel `U(r) = r² ln r`, taking `r²` as input.
pub fn radial_basis(r_squared: f64) -> f64 {
    if r_squared <= 0.0 {
        0.0
    } else {
        0.5 * r_squared * r_squared.ln()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
