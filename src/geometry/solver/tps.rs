//! Thin plate spline interpolation.
//!
//! Solves the square system `[K P; Pᵀ 0] [w; a] = [v; 0]` once for both
//! targets (two right-hand-side columns) with an LU factorisation. `K` is the
//! radial basis kernel between normalized control pixels and `P` the affine
//! block `[1 u v]`.

use nalgebra::DMatrix;

use crate::domain::control_point::{ControlPoint, TransformFamily};
use crate::error::NumericError;
use crate::geometry::solver::{centred_targets, check_pivots};
use crate::geometry::transform::{
    FittedTransform, Normalization, SplineAxis, ThinPlateSplineParams, radial_basis,
};

pub(super) fn fit(
    points: &[ControlPoint],
    pivot_tolerance: f64,
) -> Result<FittedTransform, NumericError> {
    let family = TransformFamily::ThinPlateSpline;
    let n = points.len();
    let pixels: Vec<[f64; 2]> = points.iter().map(ControlPoint::pixel).collect();
    let normalization = Normalization::from_points(&pixels);
    let control: Vec<[f64; 2]> = pixels
        .iter()
        .map(|p| normalization.apply(p[0], p[1]))
        .collect();

    let size = n + 3;
    let mut l = DMatrix::<f64>::zeros(size, size);
    for i in 0..n {
        for j in (i + 1)..n {
            let du = control[i][0] - control[j][0];
            let dv = control[i][1] - control[j][1];
            let k = radial_basis(du * du + dv * dv);
            l[(i, j)] = k;
            l[(j, i)] = k;
        }
        let row = [1.0, control[i][0], control[i][1]];
        for (c, value) in row.into_iter().enumerate() {
            l[(i, n + c)] = value;
            l[(n + c, i)] = value;
        }
    }

    let (means, targets) = centred_targets(points);
    let mut rhs = DMatrix::<f64>::zeros(size, 2);
    rhs.view_mut((0, 0), (n, 2)).copy_from(&targets);

    let lu = l.lu();
    check_pivots(&lu.u(), family, pivot_tolerance)?;
    let solution = lu
        .solve(&rhs)
        .ok_or(NumericError::SingularSystem { family, pivot: 0.0 })?;

    let axis = |col: usize, mean: f64| SplineAxis {
        weights: (0..n).map(|i| solution[(i, col)]).collect(),
        affine: [
            solution[(n, col)] + mean,
            solution[(n + 1, col)],
            solution[(n + 2, col)],
        ],
    };

    Ok(FittedTransform::ThinPlateSpline(ThinPlateSplineParams {
        normalization,
        control,
        longitude: axis(0, means[0]),
        latitude: axis(1, means[1]),
    }))
}
