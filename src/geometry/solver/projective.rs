//! Eight-parameter homography via the normalized DLT.
//!
//! Both point sets are Hartley-normalized, the system is solved with
//! `h33 = 1` in the normalized frame, then denormalized as
//! `H = Tg⁻¹ · Hn · Tp`.

use nalgebra::{DMatrix, Matrix3};

use crate::domain::control_point::{ControlPoint, TransformFamily};
use crate::error::NumericError;
use crate::geometry::solver::least_squares;
use crate::geometry::transform::{FittedTransform, Normalization, ProjectiveParams};

fn normalizations(points: &[ControlPoint]) -> (Normalization, Normalization) {
    let pixels: Vec<[f64; 2]> = points.iter().map(ControlPoint::pixel).collect();
    let geos: Vec<[f64; 2]> = points.iter().map(|p| [p.longitude, p.latitude]).collect();
    (
        Normalization::from_points(&pixels),
        Normalization::from_points(&geos),
    )
}

/// The 2n×8 DLT matrix in the normalized frame.
pub(crate) fn dlt_design_matrix(points: &[ControlPoint]) -> DMatrix<f64> {
    let (pixel_norm, geo_norm) = normalizations(points);
    build(points, &pixel_norm, &geo_norm).0
}

fn build(
    points: &[ControlPoint],
    pixel_norm: &Normalization,
    geo_norm: &Normalization,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let n = points.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 8);
    let mut b = DMatrix::<f64>::zeros(2 * n, 1);

    for (i, p) in points.iter().enumerate() {
        let [u, v] = pixel_norm.apply(p.pixel_x, p.pixel_y);
        let [gx, gy] = geo_norm.apply(p.longitude, p.latitude);

        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 0)] = u;
        a[(r0, 1)] = v;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * gx;
        a[(r0, 7)] = -v * gx;
        b[(r0, 0)] = gx;

        a[(r1, 3)] = u;
        a[(r1, 4)] = v;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -u * gy;
        a[(r1, 7)] = -v * gy;
        b[(r1, 0)] = gy;
    }

    (a, b)
}

fn to_matrix(norm: &Normalization) -> Matrix3<f64> {
    let s = norm.scale;
    Matrix3::new(
        s,
        0.0,
        -s * norm.center_x,
        0.0,
        s,
        -s * norm.center_y,
        0.0,
        0.0,
        1.0,
    )
}

fn to_inverse_matrix(norm: &Normalization) -> Matrix3<f64> {
    let inv = 1.0 / norm.scale;
    Matrix3::new(inv, 0.0, norm.center_x, 0.0, inv, norm.center_y, 0.0, 0.0, 1.0)
}

pub(super) fn fit(
    points: &[ControlPoint],
    pivot_tolerance: f64,
) -> Result<FittedTransform, NumericError> {
    let family = TransformFamily::Projective;
    let (pixel_norm, geo_norm) = normalizations(points);
    let (a, b) = build(points, &pixel_norm, &geo_norm);
    let h = least_squares(&a, &b, family, pivot_tolerance)?;

    let hn = Matrix3::new(
        h[(0, 0)],
        h[(1, 0)],
        h[(2, 0)],
        h[(3, 0)],
        h[(4, 0)],
        h[(5, 0)],
        h[(6, 0)],
        h[(7, 0)],
        1.0,
    );
    let full = to_inverse_matrix(&geo_norm) * hn * to_matrix(&pixel_norm);

    let h33 = full[(2, 2)];
    if !h33.is_finite() || h33.abs() < 1e-15 {
        return Err(NumericError::SingularSystem {
            family,
            pivot: h33.abs(),
        });
    }
    let full = full / h33;

    Ok(FittedTransform::Projective(ProjectiveParams {
        coefficients: [
            full[(0, 0)],
            full[(0, 1)],
            full[(0, 2)],
            full[(1, 0)],
            full[(1, 1)],
            full[(1, 2)],
            full[(2, 0)],
            full[(2, 1)],
        ],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::solver::fit as solve;

    fn homography(x: f64, y: f64) -> (f64, f64) {
        let w = 1.0 + 2e-5 * x - 1e-5 * y;
        ((4.0 + 1e-3 * x + 2e-4 * y) / w, (52.0 - 5e-4 * x - 1e-3 * y) / w)
    }

    fn sample(pixels: &[(f64, f64)]) -> Vec<ControlPoint> {
        pixels
            .iter()
            .map(|&(x, y)| {
                let (lon, lat) = homography(x, y);
                ControlPoint::new(x, y, lon, lat)
            })
            .collect()
    }

    #[test]
    fn test_four_point_exact_fit() {
        let points = sample(&[(0.0, 0.0), (800.0, 0.0), (800.0, 600.0), (0.0, 600.0)]);
        let t = solve(&points, TransformFamily::Projective).unwrap();
        for cp in &points {
            let g = t.apply(cp.pixel_x, cp.pixel_y);
            assert!((g.longitude - cp.longitude).abs() < 1e-9);
            assert!((g.latitude - cp.latitude).abs() < 1e-9);
        }
        let (lon, lat) = homography(400.0, 250.0);
        let g = t.apply(400.0, 250.0);
        assert!((g.longitude - lon).abs() < 1e-9);
        assert!((g.latitude - lat).abs() < 1e-9);
    }

    #[test]
    fn test_over_determined_recovers_same_homography() {
        let corners = [(0.0, 0.0), (800.0, 0.0), (800.0, 600.0), (0.0, 600.0)];
        let exact = solve(&sample(&corners), TransformFamily::Projective).unwrap();

        let mut more = corners.to_vec();
        more.extend([(400.0, 300.0), (120.0, 470.0), (650.0, 90.0)]);
        let over = solve(&sample(&more), TransformFamily::Projective).unwrap();

        let (FittedTransform::Projective(a), FittedTransform::Projective(b)) = (exact, over) else {
            panic!("expected projective");
        };
        for (x, y) in a.coefficients.iter().zip(b.coefficients.iter()) {
            assert!((x - y).abs() <= 1e-7 * x.abs() + 1e-12, "{x} vs {y}");
        }
    }

    #[test]
    fn test_dlt_rows_per_point() {
        let points = sample(&[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0), (0.5, 0.2)]);
        let a = dlt_design_matrix(&points);
        assert_eq!(a.shape(), (10, 8));
    }
}
