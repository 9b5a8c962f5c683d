//! Transform solver: fits a [`FittedTransform`] to control point
//! correspondences by linear least squares.
//!
//! Every family is solved in a normalized pixel frame (centroid at the
//! origin, mean radius sqrt(2)) with mean-centred geographic targets, then
//! mapped back so the stored parameters reproduce raw coordinates:
//!
//! ```text
//! Affine        [u v 1]                 · c = lon, lat      (QR least squares)
//! Polynomial    [1 u v u² uv v² ...]    · c = lon, lat      (QR least squares)
//! Projective    DLT, 2 rows per point   · h = [X; Y]        (QR least squares)
//! TPS           [K P; Pᵀ 0] [w; a]      = [v; 0]            (LU, square)
//! ```
//!
//! The solver is a pure function of its inputs.

mod projective;
mod tps;

use nalgebra::DMatrix;

use crate::domain::control_point::{ControlPoint, TransformFamily};
use crate::error::NumericError;
use crate::geometry::transform::{
    AffineParams, FittedTransform, Normalization, PolynomialParams, monomials,
};

pub(crate) use projective::dlt_design_matrix;

/// Relative pivot tolerance used by [`fit`].
pub const DEFAULT_PIVOT_TOLERANCE: f64 = 1e-12;

/// Fit `family` to `points` with the default pivot tolerance.
pub fn fit(
    points: &[ControlPoint],
    family: TransformFamily,
) -> Result<FittedTransform, NumericError> {
    fit_with_tolerance(points, family, DEFAULT_PIVOT_TOLERANCE)
}

/// Fit `family` to `points`, failing with `SingularSystem` when the smallest
/// pivot is below `pivot_tolerance` times the largest.
pub fn fit_with_tolerance(
    points: &[ControlPoint],
    family: TransformFamily,
    pivot_tolerance: f64,
) -> Result<FittedTransform, NumericError> {
    family.check_supported()?;
    if points.len() < family.minimum_points() {
        // Underdetermined: callers are expected to validate first, but the
        // solve itself must never be attempted.
        return Err(NumericError::SingularSystem { family, pivot: 0.0 });
    }

    match family {
        TransformFamily::Affine => fit_affine(points, pivot_tolerance),
        TransformFamily::Polynomial { order } => fit_polynomial(points, order, pivot_tolerance),
        TransformFamily::Projective => projective::fit(points, pivot_tolerance),
        TransformFamily::ThinPlateSpline => tps::fit(points, pivot_tolerance),
    }
}

/// Design matrix the solver factorises for `family`, in the normalized frame.
///
/// Used by the validator to detect rank deficiency before solving. For thin
/// plate splines this is the affine block `P`, which must have full column
/// rank for the augmented system to be solvable.
pub fn design_matrix(points: &[ControlPoint], family: TransformFamily) -> DMatrix<f64> {
    let pixels: Vec<[f64; 2]> = points.iter().map(ControlPoint::pixel).collect();
    let norm = Normalization::from_points(&pixels);
    match family {
        TransformFamily::Affine | TransformFamily::ThinPlateSpline => {
            monomial_matrix(&pixels, &norm, 1)
        }
        TransformFamily::Polynomial { order } => monomial_matrix(&pixels, &norm, order),
        TransformFamily::Projective => dlt_design_matrix(points),
    }
}

fn monomial_matrix(pixels: &[[f64; 2]], norm: &Normalization, order: u8) -> DMatrix<f64> {
    let cols = TransformFamily::monomial_count(order);
    let mut a = DMatrix::zeros(pixels.len(), cols);
    for (row, p) in pixels.iter().enumerate() {
        let [u, v] = norm.apply(p[0], p[1]);
        for (col, term) in monomials(order, u, v).into_iter().enumerate() {
            a[(row, col)] = term;
        }
    }
    a
}

/// Mean longitude/latitude and the n×2 matrix of centred targets.
fn centred_targets(points: &[ControlPoint]) -> ([f64; 2], DMatrix<f64>) {
    let n = points.len() as f64;
    let mean_lon = points.iter().map(|p| p.longitude).sum::<f64>() / n;
    let mean_lat = points.iter().map(|p| p.latitude).sum::<f64>() / n;
    let targets = DMatrix::from_fn(points.len(), 2, |row, col| {
        let p = &points[row];
        if col == 0 {
            p.longitude - mean_lon
        } else {
            p.latitude - mean_lat
        }
    });
    ([mean_lon, mean_lat], targets)
}

/// Solve `a · x ≈ b` in the least-squares sense via Householder QR.
///
/// Requires `a` to have at least as many rows as columns.
pub(crate) fn least_squares(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    family: TransformFamily,
    pivot_tolerance: f64,
) -> Result<DMatrix<f64>, NumericError> {
    if a.nrows() < a.ncols() {
        return Err(NumericError::SingularSystem { family, pivot: 0.0 });
    }

    let qr = a.clone().qr();
    let r = qr.r();
    check_pivots(&r, family, pivot_tolerance)?;

    let qtb = qr.q().transpose() * b;
    r.solve_upper_triangular(&qtb)
        .ok_or(NumericError::SingularSystem { family, pivot: 0.0 })
}

/// Fail when the smallest diagonal entry of a triangular factor is below
/// `tolerance` relative to the largest.
pub(crate) fn check_pivots(
    triangular: &DMatrix<f64>,
    family: TransformFamily,
    tolerance: f64,
) -> Result<(), NumericError> {
    let size = triangular.nrows().min(triangular.ncols());
    let diag = (0..size).map(|i| triangular[(i, i)].abs());
    let max = diag.clone().fold(0.0_f64, f64::max);
    let min = diag.fold(f64::INFINITY, f64::min);
    if max == 0.0 || !min.is_finite() {
        return Err(NumericError::SingularSystem { family, pivot: 0.0 });
    }
    let relative = min / max;
    if relative < tolerance {
        tracing::debug!(%family, relative_pivot = relative, "Rejecting near-singular system");
        return Err(NumericError::SingularSystem {
            family,
            pivot: relative,
        });
    }
    Ok(())
}

fn fit_affine(
    points: &[ControlPoint],
    pivot_tolerance: f64,
) -> Result<FittedTransform, NumericError> {
    let family = TransformFamily::Affine;
    let pixels: Vec<[f64; 2]> = points.iter().map(ControlPoint::pixel).collect();
    let norm = Normalization::from_points(&pixels);
    // Column order [1, u, v] from the order-1 monomials.
    let a = monomial_matrix(&pixels, &norm, 1);
    let (means, targets) = centred_targets(points);
    let solution = least_squares(&a, &targets, family, pivot_tolerance)?;

    // target = c0 + c1*u + c2*v with u = s(x - cx), v = s(y - cy)
    let denormalize = |col: usize, mean: f64| -> [f64; 3] {
        let (c0, c1, c2) = (solution[(0, col)], solution[(1, col)], solution[(2, col)]);
        let s = norm.scale;
        [
            c1 * s,
            c2 * s,
            c0 + mean - c1 * s * norm.center_x - c2 * s * norm.center_y,
        ]
    };

    Ok(FittedTransform::Affine(AffineParams {
        longitude: denormalize(0, means[0]),
        latitude: denormalize(1, means[1]),
    }))
}

fn fit_polynomial(
    points: &[ControlPoint],
    order: u8,
    pivot_tolerance: f64,
) -> Result<FittedTransform, NumericError> {
    let family = TransformFamily::Polynomial { order };
    let pixels: Vec<[f64; 2]> = points.iter().map(ControlPoint::pixel).collect();
    let normalization = Normalization::from_points(&pixels);
    let a = monomial_matrix(&pixels, &normalization, order);
    let (means, targets) = centred_targets(points);
    let solution = least_squares(&a, &targets, family, pivot_tolerance)?;

    let mut longitude: Vec<f64> = solution.column(0).iter().copied().collect();
    let mut latitude: Vec<f64> = solution.column(1).iter().copied().collect();
    // Monomial 0 is the constant term.
    longitude[0] += means[0];
    latitude[0] += means[1];

    Ok(FittedTransform::Polynomial(PolynomialParams {
        order,
        normalization,
        longitude,
        latitude,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn scenario_points() -> Vec<ControlPoint> {
        vec![
            ControlPoint::new(0.0, 0.0, -122.0, 37.0),
            ControlPoint::new(100.0, 0.0, -121.999, 37.0),
            ControlPoint::new(0.0, 100.0, -122.0, 37.001),
        ]
    }

    /// A smooth but clearly non-affine mapping over a 1000 px page.
    pub(crate) fn warped(x: f64, y: f64) -> (f64, f64) {
        let lon = 10.0 + 1e-4 * x + 2e-5 * y + 1e-9 * x * y;
        let lat = 50.0 - 1e-4 * y + 1e-5 * x + 5e-10 * x * x;
        (lon, lat)
    }

    fn grid(n: usize, f: impl Fn(f64, f64) -> (f64, f64)) -> Vec<ControlPoint> {
        let mut points = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let x = 1000.0 * i as f64 / (n - 1) as f64 + 7.0 * j as f64;
                let y = 1000.0 * j as f64 / (n - 1) as f64 + 3.0 * i as f64;
                let (lon, lat) = f(x, y);
                points.push(ControlPoint::new(x, y, lon, lat));
            }
        }
        points
    }

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "{a} vs {b} (tol {tol})");
    }

    #[test]
    fn test_affine_scenario_exact_fit() {
        let t = fit(&scenario_points(), TransformFamily::Affine).unwrap();
        let p = t.apply(50.0, 50.0);
        assert_close(p.longitude, -121.9995, 1e-10);
        assert_close(p.latitude, 37.0005, 1e-10);
        for cp in scenario_points() {
            let g = t.apply(cp.pixel_x, cp.pixel_y);
            assert_close(g.longitude, cp.longitude, 1e-11);
            assert_close(g.latitude, cp.latitude, 1e-11);
        }
    }

    #[test]
    fn test_affine_coefficients_are_derived_from_points() {
        let t = fit(&scenario_points(), TransformFamily::Affine).unwrap();
        let FittedTransform::Affine(p) = t else {
            panic!("expected affine");
        };
        assert_close(p.longitude[0], 1e-5, 1e-14);
        assert_close(p.longitude[1], 0.0, 1e-14);
        assert_close(p.longitude[2], -122.0, 1e-11);
        assert_close(p.latitude[0], 0.0, 1e-14);
        assert_close(p.latitude[1], 1e-5, 1e-14);
        assert_close(p.latitude[2], 37.0, 1e-11);
    }

    #[test]
    fn test_affine_extra_consistent_point_does_not_change_fit() {
        let exact = fit(&scenario_points(), TransformFamily::Affine).unwrap();
        let mut points = scenario_points();
        points.push(ControlPoint::new(100.0, 100.0, -121.999, 37.001));
        let over = fit(&points, TransformFamily::Affine).unwrap();
        let (FittedTransform::Affine(a), FittedTransform::Affine(b)) = (exact, over) else {
            panic!("expected affine");
        };
        for i in 0..3 {
            assert_close(a.longitude[i], b.longitude[i], 1e-11);
            assert_close(a.latitude[i], b.latitude[i], 1e-11);
        }
    }

    #[test]
    fn test_polynomial_order_two_exact_at_minimum() {
        let points: Vec<ControlPoint> = [
            (0.0, 0.0),
            (1000.0, 0.0),
            (0.0, 1000.0),
            (1000.0, 1000.0),
            (500.0, 200.0),
            (300.0, 700.0),
        ]
        .iter()
        .map(|&(x, y)| {
            let (lon, lat) = warped(x, y);
            ControlPoint::new(x, y, lon, lat)
        })
        .collect();
        let t = fit(&points, TransformFamily::Polynomial { order: 2 }).unwrap();
        for cp in &points {
            let g = t.apply(cp.pixel_x, cp.pixel_y);
            assert_close(g.longitude, cp.longitude, 1e-10);
            assert_close(g.latitude, cp.latitude, 1e-10);
        }
        // The warp is itself quadratic, so off-point predictions match too.
        let (lon, lat) = warped(250.0, 800.0);
        let g = t.apply(250.0, 800.0);
        assert_close(g.longitude, lon, 1e-9);
        assert_close(g.latitude, lat, 1e-9);
    }

    #[test]
    fn test_polynomial_over_determined_matches_exact() {
        let points = grid(4, warped);
        let t = fit(&points, TransformFamily::Polynomial { order: 2 }).unwrap();
        for cp in &points {
            let g = t.apply(cp.pixel_x, cp.pixel_y);
            assert_close(g.longitude, cp.longitude, 1e-10);
            assert_close(g.latitude, cp.latitude, 1e-10);
        }
    }

    #[test]
    fn test_polynomial_order_one_matches_affine() {
        let affine = fit(&scenario_points(), TransformFamily::Affine).unwrap();
        let poly = fit(&scenario_points(), TransformFamily::Polynomial { order: 1 }).unwrap();
        let a = affine.apply(37.0, 81.0);
        let b = poly.apply(37.0, 81.0);
        assert_close(a.longitude, b.longitude, 1e-11);
        assert_close(a.latitude, b.latitude, 1e-11);
    }

    #[test]
    fn test_collinear_points_are_singular() {
        let points = vec![
            ControlPoint::new(0.0, 0.0, 1.0, 1.0),
            ControlPoint::new(10.0, 10.0, 1.1, 1.1),
            ControlPoint::new(20.0, 20.0, 1.2, 1.2),
        ];
        assert!(matches!(
            fit(&points, TransformFamily::Affine),
            Err(NumericError::SingularSystem { .. })
        ));
    }

    #[test]
    fn test_underdetermined_input_never_solves() {
        let points = &scenario_points()[..2];
        assert!(matches!(
            fit(points, TransformFamily::Affine),
            Err(NumericError::SingularSystem { .. })
        ));
    }

    #[test]
    fn test_unsupported_polynomial_order() {
        assert!(matches!(
            fit(&grid(5, warped), TransformFamily::Polynomial { order: 7 }),
            Err(NumericError::UnsupportedFamily(_))
        ));
    }

    #[test]
    fn test_design_matrix_shapes() {
        let points = grid(3, warped);
        assert_eq!(design_matrix(&points, TransformFamily::Affine).shape(), (9, 3));
        assert_eq!(
            design_matrix(&points, TransformFamily::Polynomial { order: 2 }).shape(),
            (9, 6)
        );
        assert_eq!(design_matrix(&points, TransformFamily::Projective).shape(), (18, 8));
        assert_eq!(design_matrix(&points, TransformFamily::ThinPlateSpline).shape(), (9, 3));
    }
}
