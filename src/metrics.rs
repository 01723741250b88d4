//! Evaluation utilities for posterior samples (small + explicit).
//!
//! These helpers are intentionally "glass box":
//! - they do not hide normalization (FFT magnitudes are unnormalized, like `numpy.fft.fft2`)
//! - they surface the exact scalar computed (and what it is *not*)

use crate::operator::ForwardOperator;
use crate::{Error, Result};
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis};
use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

/// Number of radial bins used for an `n × n` field when none is requested:
/// edges `linspace(0, n/2, 2 * (n/2))`, i.e. half-pixel annuli.
pub fn default_radial_bins(n: usize) -> usize {
    (2 * (n / 2)).saturating_sub(1).max(1)
}

/// Magnitude of the 2-D DFT of `field` (unnormalized, zero frequency at `[0, 0]`).
pub fn fft2_magnitude(field: &ArrayView2<f32>) -> Array2<f32> {
    let (h, w) = field.dim();
    let mut buf: Array2<Complex32> = field.mapv(|v| Complex32::new(v, 0.0));
    let mut planner = FftPlanner::<f32>::new();

    let row_fft = planner.plan_fft_forward(w);
    let mut scratch: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); w];
    for mut row in buf.rows_mut() {
        scratch.iter_mut().zip(row.iter()).for_each(|(s, &v)| *s = v);
        row_fft.process(&mut scratch);
        row.iter_mut().zip(scratch.iter()).for_each(|(v, &s)| *v = s);
    }

    let col_fft = planner.plan_fft_forward(h);
    let mut scratch: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); h];
    for mut col in buf.columns_mut() {
        scratch.iter_mut().zip(col.iter()).for_each(|(s, &v)| *s = v);
        col_fft.process(&mut scratch);
        col.iter_mut().zip(scratch.iter()).for_each(|(v, &s)| *v = s);
    }

    buf.mapv(|c| c.norm())
}

/// Azimuthally averaged spectrum magnitude of one field.
///
/// The spectrum is centred (fftshift), then averaged over annuli around `(h/2, w/2)` with
/// `n_bins` equal-width radius bins spanning `[0, min(h, w)/2)`. A pixel at radius `r` falls in
/// bin `k` when `edge[k] <= r < edge[k + 1]`. Empty bins report `0`.
///
/// This is the mean **magnitude** per annulus, not the squared power.
pub fn radial_power_spectrum(field: &ArrayView2<f32>, n_bins: usize) -> Result<Array1<f32>> {
    let (h, w) = field.dim();
    if h == 0 || w == 0 {
        return Err(Error::ShapeMismatch("field must be non-empty".into()));
    }
    if n_bins == 0 {
        return Err(Error::Configuration("n_bins must be >= 1".into()));
    }

    let mag = fft2_magnitude(field);
    let (ci, cj) = (h / 2, w / 2);
    let max_r = (h.min(w) / 2) as f64;
    let width = max_r / n_bins as f64;

    let mut sums = vec![0.0f64; n_bins];
    let mut counts = vec![0usize; n_bins];
    for i in 0..h {
        for j in 0..w {
            let di = i as f64 - ci as f64;
            let dj = j as f64 - cj as f64;
            let r = (di * di + dj * dj).sqrt();
            if width <= 0.0 || r >= max_r {
                continue;
            }
            let k = ((r / width) as usize).min(n_bins - 1);
            // Undo the shift: centred index (i, j) holds unshifted frequency (i - h/2, j - w/2).
            let si = (i + h - ci) % h;
            let sj = (j + w - cj) % w;
            sums[k] += mag[[si, sj]] as f64;
            counts[k] += 1;
        }
    }

    Ok(sums
        .iter()
        .zip(counts.iter())
        .map(|(&s, &c)| if c > 0 { (s / c as f64) as f32 } else { 0.0 })
        .collect())
}

/// Radial spectrum of the channel-summed field of every batch element, shape `(B, n_bins)`.
pub fn batch_radial_power_spectrum(x: &ArrayView4<f32>, n_bins: usize) -> Result<Array2<f32>> {
    let b = x.len_of(Axis(0));
    let mut out = Array2::<f32>::zeros((b, n_bins));
    for (bi, xb) in x.outer_iter().enumerate() {
        let summed = xb.sum_axis(Axis(0));
        let spec = radial_power_spectrum(&summed.view(), n_bins)?;
        out.row_mut(bi).assign(&spec);
    }
    Ok(out)
}

/// Per-mode relative power deviation of a sample against a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalDeviation {
    /// Mean over batch and channels of \(|P_x - P_{ref}| / P_{ref}\), per mode.
    pub mean: Array1<f32>,
    /// Population standard deviation of the same quantity, per mode.
    pub std: Array1<f32>,
    /// How many (batch, channel) entries contributed, per mode.
    pub count: Array1<usize>,
}

/// Modal power deviation from modal coefficients of shape `(B, C, M)`.
///
/// With \(P = a^2\) per coefficient, entries where the reference power is zero are skipped; a
/// mode with no contributing entry reports `NaN` mean and std.
pub fn modal_power_deviation(
    x_modes: &ArrayView3<f32>,
    ref_modes: &ArrayView3<f32>,
) -> Result<ModalDeviation> {
    if x_modes.dim() != ref_modes.dim() {
        return Err(Error::ShapeMismatch(format!(
            "modal arrays differ: {:?} vs {:?}",
            x_modes.dim(),
            ref_modes.dim()
        )));
    }
    let m = x_modes.len_of(Axis(2));
    let mut sum = vec![0.0f64; m];
    let mut sum_sq = vec![0.0f64; m];
    let mut count = vec![0usize; m];

    for (xs, rs) in x_modes
        .lanes(Axis(2))
        .into_iter()
        .zip(ref_modes.lanes(Axis(2)))
    {
        for k in 0..m {
            let pr = (rs[k] as f64).powi(2);
            if pr == 0.0 {
                continue;
            }
            let d = ((xs[k] as f64).powi(2) - pr).abs() / pr;
            sum[k] += d;
            sum_sq[k] += d * d;
            count[k] += 1;
        }
    }

    let mut mean = Array1::<f32>::from_elem(m, f32::NAN);
    let mut std = Array1::<f32>::from_elem(m, f32::NAN);
    for k in 0..m {
        if count[k] > 0 {
            let n = count[k] as f64;
            let mu = sum[k] / n;
            let var = (sum_sq[k] / n - mu * mu).max(0.0);
            mean[k] = mu as f32;
            std[k] = var.sqrt() as f32;
        }
    }

    Ok(ModalDeviation {
        mean,
        std,
        count: Array1::from_vec(count),
    })
}

/// [`modal_power_deviation`] of two field batches, projected through `op`.
pub fn modal_power_deviation_fields(
    op: &ForwardOperator,
    x: &ArrayView4<f32>,
    reference: &ArrayView4<f32>,
) -> Result<ModalDeviation> {
    let xm: Array3<f32> = op.project_batch(x)?;
    let rm: Array3<f32> = op.project_batch(reference)?;
    modal_power_deviation(&xm.view(), &rm.view())
}

/// Root-mean-square difference of two equally shaped batches.
pub fn rmse(a: &ArrayView4<f32>, b: &ArrayView4<f32>) -> Result<f32> {
    if a.dim() != b.dim() {
        return Err(Error::ShapeMismatch(format!(
            "batches differ: {:?} vs {:?}",
            a.dim(),
            b.dim()
        )));
    }
    if a.is_empty() {
        return Err(Error::ShapeMismatch("batches must be non-empty".into()));
    }
    let ss: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&p, &q)| ((p - q) as f64).powi(2))
        .sum();
    Ok((ss / a.len() as f64).sqrt() as f32)
}
