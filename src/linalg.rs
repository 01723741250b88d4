//! Small dense linear algebra in `f64`, on top of `nalgebra`.
//!
//! The matrices here are small (M × M covariances with M = number of retained modes, and the
//! P × M modal basis). `ndarray` views are copied into `DMatrix` and back; what matters is that
//! failure is reported instead of producing `inf`/`NaN`.

use crate::{Error, Result};
use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};

/// Largest 1-norm condition number we accept from [`invert`].
///
/// Beyond this, an `f32` state update driven by the inverse loses all significant digits.
pub const MAX_CONDITION: f64 = 1e12;

/// Relative cutoff for small singular values in [`pseudo_inverse`] (same default as NumPy).
pub const PINV_RCOND: f64 = 1e-15;

/// Induced 1-norm (maximum absolute column sum).
pub fn norm_1(a: &ArrayView2<f64>) -> f64 {
    a.columns()
        .into_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

fn to_dmatrix(a: &ArrayView2<f64>) -> DMatrix<f64> {
    let (r, c) = a.dim();
    DMatrix::from_row_iterator(r, c, a.iter().copied())
}

fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}

/// Invert a square matrix through its LU decomposition.
///
/// Errors:
/// - [`Error::ShapeMismatch`] if `a` is not square,
/// - [`Error::NumericalInstability`] if `a` has non-finite entries, is singular, or its 1-norm
///   condition number exceeds [`MAX_CONDITION`].
pub fn invert(a: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(Error::ShapeMismatch(format!(
            "cannot invert a {}x{} matrix",
            a.nrows(),
            a.ncols()
        )));
    }
    if n == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(Error::NumericalInstability(
            "matrix has non-finite entries".into(),
        ));
    }

    let scale = norm_1(a);
    if scale == 0.0 {
        return Err(Error::NumericalInstability("matrix is identically zero".into()));
    }

    let Some(inv) = to_dmatrix(a).lu().try_inverse() else {
        return Err(Error::NumericalInstability(format!(
            "singular {n}x{n} matrix"
        )));
    };
    let inv = from_dmatrix(&inv);

    let cond = scale * norm_1(&inv.view());
    if !cond.is_finite() || cond > MAX_CONDITION {
        return Err(Error::NumericalInstability(format!(
            "ill-conditioned matrix: cond_1 = {cond:.3e}"
        )));
    }
    Ok(inv)
}

/// Moore–Penrose pseudo-inverse via SVD, like `numpy.linalg.pinv`.
///
/// `z` is `P × M`; the result is `M × P`. Singular values at or below
/// `PINV_RCOND * s_max` are treated as zero, so a rank-deficient basis still yields the
/// minimum-norm inverse (with a warning).
pub fn pseudo_inverse(z: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let (p, m) = z.dim();
    if m == 0 || p == 0 {
        return Err(Error::ShapeMismatch(format!(
            "pseudo-inverse needs a non-empty matrix, got {p}x{m}"
        )));
    }
    if z.iter().any(|v| !v.is_finite()) {
        return Err(Error::NumericalInstability(
            "matrix has non-finite entries".into(),
        ));
    }

    let svd = to_dmatrix(z)
        .try_svd(true, true, f64::EPSILON, 10_000)
        .ok_or_else(|| Error::NumericalInstability("SVD did not converge".into()))?;
    let s_max = svd.singular_values.max();
    if !(s_max > 0.0) {
        return Err(Error::NumericalInstability("matrix is identically zero".into()));
    }
    let cutoff = PINV_RCOND * s_max;
    let dropped = svd.singular_values.iter().filter(|&&s| s <= cutoff).count();
    if dropped > 0 {
        tracing::warn!(dropped, rank = svd.singular_values.len() - dropped, "rank-deficient basis");
    }

    let pinv = svd
        .pseudo_inverse(cutoff)
        .map_err(|e| Error::NumericalInstability(format!("pseudo-inverse: {e}")))?;
    Ok(from_dmatrix(&pinv))
}
