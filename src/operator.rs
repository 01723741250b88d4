//! The linear forward operator: pupil restriction followed by a modal decomposition.
//!
//! A field is an `H × W` image. Only the pixels inside the pupil carry signal; those `P` pixels
//! are enumerated in row-major order and stacked into a vector. The mode decomposition
//! `mode_decomp` (`M × P`) maps that vector to `M` modal coefficients:
//!
//! \[
//! A x = D \, x|_{\text{pupil}}, \qquad D = Z^+ ,
//! \]
//!
//! where `Z` (`P × M`) is the modal basis restricted to the pupil. The round-trip matrix
//! `aa_t = D Z` (`M × M`) enters the likelihood covariance.

use crate::linalg::pseudo_inverse;
use crate::{Error, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView4};

/// Boolean mask of valid pupil pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PupilMask {
    mask: Array2<bool>,
}

impl PupilMask {
    pub fn new(mask: Array2<bool>) -> Self {
        Self { mask }
    }

    /// Build a mask from a numeric array; nonzero entries are valid.
    pub fn from_numeric(values: &ArrayView2<f32>) -> Self {
        Self {
            mask: values.mapv(|v| v != 0.0),
        }
    }

    /// Circular pupil of diameter `n` pixels centred on an `n × n` grid.
    pub fn circular(n: usize) -> Self {
        let c = (n as f32 - 1.0) / 2.0;
        let r2 = (n as f32 / 2.0) * (n as f32 / 2.0);
        let mask = Array2::from_shape_fn((n, n), |(i, j)| {
            let di = i as f32 - c;
            let dj = j as f32 - c;
            di * di + dj * dj <= r2
        });
        Self { mask }
    }

    /// Zero-pad the mask by `pad` pixels on every side.
    ///
    /// WFS masks are usually stored one pixel smaller than the image grid on each side.
    pub fn padded(&self, pad: usize) -> Self {
        let (h, w) = self.mask.dim();
        let mut out = Array2::from_elem((h + 2 * pad, w + 2 * pad), false);
        for ((i, j), &v) in self.mask.indexed_iter() {
            out[[i + pad, j + pad]] = v;
        }
        Self { mask: out }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn as_array(&self) -> &Array2<bool> {
        &self.mask
    }

    pub fn count(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }

    /// Valid pixel coordinates in row-major order.
    pub fn valid_pixels(&self) -> Vec<(usize, usize)> {
        self.mask
            .indexed_iter()
            .filter_map(|(ij, &v)| v.then_some(ij))
            .collect()
    }
}

/// Pupil restriction + mode decomposition, with the round-trip matrix.
#[derive(Debug, Clone)]
pub struct ForwardOperator {
    mode_decomp: Array2<f32>,
    aa_t: Array2<f32>,
    valid: Vec<(usize, usize)>,
    field_shape: (usize, usize),
    modes: Option<Array2<f32>>,
}

impl ForwardOperator {
    /// Assemble an operator from precomputed artifacts.
    ///
    /// - `mode_decomp`: `M × P`
    /// - `aa_t`: `M × M`
    /// - `valid`: `P` pixel coordinates inside `field_shape`
    pub fn new(
        mode_decomp: Array2<f32>,
        aa_t: Array2<f32>,
        valid: Vec<(usize, usize)>,
        field_shape: (usize, usize),
    ) -> Result<Self> {
        let (m, p) = mode_decomp.dim();
        if m == 0 {
            return Err(Error::ShapeMismatch(
                "mode_decomp must retain at least one mode".into(),
            ));
        }
        if p != valid.len() {
            return Err(Error::ShapeMismatch(format!(
                "mode_decomp has {p} columns but the pupil has {} valid pixels",
                valid.len()
            )));
        }
        if m > p {
            return Err(Error::ShapeMismatch(format!(
                "{m} modes exceed the {p} valid pupil pixels"
            )));
        }
        if aa_t.dim() != (m, m) {
            return Err(Error::ShapeMismatch(format!(
                "aa_t must be {m}x{m}, got {:?}",
                aa_t.dim()
            )));
        }
        let (h, w) = field_shape;
        if let Some(&(i, j)) = valid.iter().find(|&&(i, j)| i >= h || j >= w) {
            return Err(Error::ShapeMismatch(format!(
                "valid pixel ({i}, {j}) lies outside the {h}x{w} field"
            )));
        }
        if mode_decomp.iter().chain(aa_t.iter()).any(|v| !v.is_finite()) {
            return Err(Error::NumericalInstability(
                "operator matrices contain non-finite entries".into(),
            ));
        }
        Ok(Self {
            mode_decomp,
            aa_t,
            valid,
            field_shape,
            modes: None,
        })
    }

    /// Build the operator from a modal basis restricted to the pupil.
    ///
    /// `modes` is `P × M` (one column per mode, rows ordered like [`PupilMask::valid_pixels`]).
    /// The decomposition is the pseudo-inverse of `modes`, computed in `f64`.
    pub fn from_modes(modes: &ArrayView2<f32>, mask: &PupilMask) -> Result<Self> {
        let valid = mask.valid_pixels();
        if modes.nrows() != valid.len() {
            return Err(Error::ShapeMismatch(format!(
                "modal basis has {} rows but the pupil has {} valid pixels",
                modes.nrows(),
                valid.len()
            )));
        }
        let z = modes.mapv(f64::from);
        let d = pseudo_inverse(&z.view())?;
        let aa_t = d.dot(&z);

        let mut op = Self::new(
            d.mapv(|v| v as f32),
            aa_t.mapv(|v| v as f32),
            valid,
            mask.shape(),
        )?;
        op.modes = Some(modes.to_owned());
        Ok(op)
    }

    pub fn num_modes(&self) -> usize {
        self.mode_decomp.nrows()
    }

    pub fn num_pixels(&self) -> usize {
        self.valid.len()
    }

    pub fn field_shape(&self) -> (usize, usize) {
        self.field_shape
    }

    pub fn valid_pixels(&self) -> &[(usize, usize)] {
        &self.valid
    }

    pub fn mode_decomp(&self) -> &Array2<f32> {
        &self.mode_decomp
    }

    pub fn aa_t(&self) -> &Array2<f32> {
        &self.aa_t
    }

    /// The modal basis, when the operator was built with [`Self::from_modes`].
    pub fn modes(&self) -> Option<&Array2<f32>> {
        self.modes.as_ref()
    }

    /// Fail unless a field of `(h, w)` matches the operator's grid.
    pub fn check_field_shape(&self, h: usize, w: usize) -> Result<()> {
        if (h, w) != self.field_shape {
            return Err(Error::ShapeMismatch(format!(
                "field is {h}x{w} but the operator expects {:?}",
                self.field_shape
            )));
        }
        Ok(())
    }

    /// Pupil pixels of `field`, in valid-pixel order.
    pub fn gather(&self, field: &ArrayView2<f32>) -> Array1<f32> {
        debug_assert_eq!(field.dim(), self.field_shape);
        self.valid.iter().map(|&(i, j)| field[[i, j]]).collect()
    }

    /// Modal coefficients `A x` of one `H × W` field.
    pub fn project(&self, field: &ArrayView2<f32>) -> Array1<f32> {
        self.mode_decomp.dot(&self.gather(field))
    }

    /// Modal coefficients of a `(B, C, H, W)` batch, as `(B, C, M)`.
    pub fn project_batch(&self, x: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let (b, c, h, w) = x.dim();
        self.check_field_shape(h, w)?;
        let m = self.num_modes();
        let mut out = Array3::<f32>::zeros((b, c, m));
        for bi in 0..b {
            for ci in 0..c {
                let coeffs = self.project(&x.slice(ndarray::s![bi, ci, .., ..]));
                out.slice_mut(ndarray::s![bi, ci, ..]).assign(&coeffs);
            }
        }
        Ok(out)
    }

    /// Adjoint `A^T c`: spread modal coefficients back onto the pupil pixels.
    ///
    /// Pixels outside the pupil are zero.
    pub fn adjoint(&self, coeffs: &ArrayView1<f32>) -> Array2<f32> {
        debug_assert_eq!(coeffs.len(), self.num_modes());
        let v = self.mode_decomp.t().dot(coeffs);
        self.scatter(&v.view())
    }

    /// Field synthesised from modal coefficients, `Z c` on the pupil.
    pub fn reconstruct(&self, coeffs: &ArrayView1<f32>) -> Result<Array2<f32>> {
        let modes = self.modes.as_ref().ok_or_else(|| {
            Error::Configuration("operator was not built from a modal basis".into())
        })?;
        if coeffs.len() != modes.ncols() {
            return Err(Error::ShapeMismatch(format!(
                "expected {} modal coefficients, got {}",
                modes.ncols(),
                coeffs.len()
            )));
        }
        Ok(self.scatter(&modes.dot(coeffs).view()))
    }

    fn scatter(&self, values: &ArrayView1<f32>) -> Array2<f32> {
        let mut field = Array2::<f32>::zeros(self.field_shape);
        for (&(i, j), &v) in self.valid.iter().zip(values.iter()) {
            field[[i, j]] = v;
        }
        field
    }
}

/// Low-order polynomial basis on a pupil, orthonormalized over the valid pixels.
///
/// Columns start from the monomials `u^a v^b` in order of increasing total degree (piston, tip,
/// tilt, then the quadratic terms, ...), with `u, v` the grid coordinates scaled to `[-1, 1]`.
/// They are then Gram–Schmidt orthogonalized over the pupil and scaled to unit RMS, the same
/// normalization a Zernike basis uses. This stands in for a basis loaded from disk.
pub fn polynomial_modes(mask: &PupilMask, num_modes: usize) -> Array2<f32> {
    let (h, w) = mask.shape();
    let valid = mask.valid_pixels();
    let p = valid.len();
    let su = if h > 1 { (h - 1) as f64 / 2.0 } else { 1.0 };
    let sv = if w > 1 { (w - 1) as f64 / 2.0 } else { 1.0 };

    let mut exps: Vec<(i32, i32)> = Vec::with_capacity(num_modes);
    let mut deg = 0i32;
    while exps.len() < num_modes {
        for a in (0..=deg).rev() {
            if exps.len() == num_modes {
                break;
            }
            exps.push((a, deg - a));
        }
        deg += 1;
    }

    let mut z = Array2::<f64>::zeros((p, num_modes));
    for (row, &(i, j)) in valid.iter().enumerate() {
        let u = i as f64 / su - 1.0;
        let v = j as f64 / sv - 1.0;
        for (col, &(a, b)) in exps.iter().enumerate() {
            z[[row, col]] = u.powi(a) * v.powi(b);
        }
    }

    // Modified Gram-Schmidt; columns end with sum of squares == P.
    let target = (p as f64).sqrt();
    for k in 0..num_modes {
        for q in 0..k {
            let proj = z.column(k).dot(&z.column(q)) / (p as f64);
            let qcol = z.column(q).to_owned();
            z.column_mut(k).scaled_add(-proj, &qcol);
        }
        let norm = z.column(k).dot(&z.column(k)).sqrt();
        if norm > 0.0 {
            z.column_mut(k).mapv_inplace(|v| v * target / norm);
        }
    }
    z.mapv(|v| v as f32)
}
