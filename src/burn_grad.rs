//! Burn-backed (opt-in) likelihood score via automatic differentiation.
//!
//! This module is intentionally **additive**: the sampler always uses the closed form in
//! [`crate::likelihood`]. Here the same log-likelihood is written as a Burn tensor program and
//! differentiated with `burn-autodiff`, one batch element at a time, so the two can be compared.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4};

use crate::likelihood::MeasurementCovariance;
use crate::operator::ForwardOperator;
use crate::{Error, Result};

/// Default burn backend for the cross-check: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

fn ndarray_to_burn_2<B: Backend>(device: &B::Device, x: &ArrayView2<f32>) -> Tensor<B, 2> {
    let (r, c) = x.dim();
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [r, c]);
    Tensor::from_data(data, device)
}

/// \(\nabla_x \ell\) for one batch element, by reverse-mode autodiff.
///
/// Shapes as in [`crate::likelihood::likelihood_score`]: `x` is `(C, H, W)`, `y` is `(C, M)`.
pub fn likelihood_score_autodiff(
    device: &<BurnBackend as Backend>::Device,
    op: &ForwardOperator,
    x: &ArrayView3<f32>,
    y: &ArrayView2<f32>,
    sigma_inv: &ArrayView2<f32>,
) -> Result<Array3<f32>> {
    let (c, h, w) = x.dim();
    op.check_field_shape(h, w)?;
    let m = op.num_modes();
    if y.dim() != (c, m) || sigma_inv.dim() != (m, m) {
        return Err(Error::ShapeMismatch(format!(
            "observation {:?} and inverse covariance {:?} must be ({c}, {m}) and ({m}, {m})",
            y.dim(),
            sigma_inv.dim()
        )));
    }
    let p = op.num_pixels();

    // Pupil pixels of every channel, (C, P).
    let mut xv = Array2::<f32>::zeros((c, p));
    for (ci, xc) in x.outer_iter().enumerate() {
        xv.row_mut(ci).assign(&op.gather(&xc));
    }

    let x_t = ndarray_to_burn_2::<BurnBackend>(device, &xv.view()).require_grad();
    let d = ndarray_to_burn_2::<BurnBackend>(device, &op.mode_decomp().view());
    let y_t = ndarray_to_burn_2::<BurnBackend>(device, y);
    let s_t = ndarray_to_burn_2::<BurnBackend>(device, sigma_inv);

    // r = y - A x, row per channel; quadratic form summed over channels.
    let ax = x_t.clone().matmul(d.transpose());
    let r = y_t - ax;
    let sr = r.clone().matmul(s_t.transpose());
    let ll = (r * sr).sum().mul_scalar(-0.5);

    let grads = ll.backward();
    let gx = x_t
        .grad(&grads)
        .ok_or_else(|| Error::NumericalInstability("autodiff produced no gradient".into()))?;
    let flat = gx
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| Error::NumericalInstability(format!("reading gradient: {e:?}")))?;

    let mut out = Array3::<f32>::zeros(x.raw_dim());
    for ci in 0..c {
        let row = ArrayView1::from(&flat[ci * p..(ci + 1) * p]);
        for (&(i, j), &g) in op.valid_pixels().iter().zip(row.iter()) {
            out[[ci, i, j]] = g;
        }
    }
    Ok(out)
}

/// Batched autodiff score: one gradient per batch element, each with its own \(\Sigma_t^{-1}\).
pub fn batch_likelihood_score_autodiff(
    device: &<BurnBackend as Backend>::Device,
    op: &ForwardOperator,
    cov: &MeasurementCovariance,
    x: &ArrayView4<f32>,
    y: &ArrayView3<f32>,
    sig_t: &ArrayView1<f32>,
) -> Result<Array4<f32>> {
    let (b, c, h, w) = x.dim();
    op.check_field_shape(h, w)?;
    if y.dim() != (b, c, op.num_modes()) {
        return Err(Error::ShapeMismatch(format!(
            "observation is {:?}, expected ({b}, {c}, {})",
            y.dim(),
            op.num_modes()
        )));
    }
    if sig_t.len() != b {
        return Err(Error::ShapeMismatch(format!(
            "sigma(t) has {} entries for batch {b}",
            sig_t.len()
        )));
    }
    let mut out = Array4::<f32>::zeros(x.raw_dim());
    for bi in 0..b {
        let s_inv = cov.inverse_at(sig_t[bi])?;
        let g = likelihood_score_autodiff(
            device,
            op,
            &x.slice(s![bi, .., .., ..]),
            &y.slice(s![bi, .., ..]),
            &s_inv.view(),
        )?;
        out.slice_mut(s![bi, .., .., ..]).assign(&g);
    }
    Ok(out)
}
