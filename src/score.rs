//! The score-model seam.
//!
//! The sampler never owns a network. It talks to a [`ScoreModel`], which exposes the noise
//! schedule of the forward SDE and the learned score \(\nabla_x \log p_t(x)\).
//!
//! Two concrete pieces live here:
//! - [`VeSde`]: the variance-exploding schedule \(\sigma(t) = \sigma_{min}(\sigma_{max}/\sigma_{min})^t\),
//! - [`GaussianPrior`]: a VE-perturbed isotropic Gaussian whose score is known exactly. It is a
//!   reference prior for tests and benches, not a model of wavefronts.

use crate::{Error, Result};
use ndarray::{Array1, Array4, ArrayView1, ArrayView4};

/// Noise schedule + learned score of a pretrained diffusion model.
///
/// `t` is batch shaped (one time per batch element); `x` is `(B, C, H, W)`.
pub trait ScoreModel {
    fn sigma_min(&self) -> f32;
    fn sigma_max(&self) -> f32;

    /// Marginal noise level \(\sigma(t)\), one value per batch element.
    fn sigma(&self, t: &ArrayView1<f32>) -> Array1<f32>;

    /// Diffusion coefficient \(g(t)\) of the forward SDE, one value per batch element.
    fn diffusion(&self, t: &ArrayView1<f32>, x: &ArrayView4<f32>) -> Array1<f32>;

    /// Prior score \(\nabla_x \log p_t(x)\), same shape as `x`.
    fn score(&self, t: &ArrayView1<f32>, x: &ArrayView4<f32>) -> Result<Array4<f32>>;
}

impl<T: ScoreModel + ?Sized> ScoreModel for &T {
    fn sigma_min(&self) -> f32 {
        (**self).sigma_min()
    }
    fn sigma_max(&self) -> f32 {
        (**self).sigma_max()
    }
    fn sigma(&self, t: &ArrayView1<f32>) -> Array1<f32> {
        (**self).sigma(t)
    }
    fn diffusion(&self, t: &ArrayView1<f32>, x: &ArrayView4<f32>) -> Array1<f32> {
        (**self).diffusion(t, x)
    }
    fn score(&self, t: &ArrayView1<f32>, x: &ArrayView4<f32>) -> Result<Array4<f32>> {
        (**self).score(t, x)
    }
}

/// Variance-exploding SDE schedule.
///
/// \[
/// \sigma(t) = \sigma_{min} \left(\frac{\sigma_{max}}{\sigma_{min}}\right)^t,\qquad
/// g(t) = \sigma(t)\sqrt{2 \ln(\sigma_{max}/\sigma_{min})}.
/// \]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VeSde {
    sigma_min: f32,
    sigma_max: f32,
}

impl VeSde {
    pub fn new(sigma_min: f32, sigma_max: f32) -> Result<Self> {
        if !(sigma_min > 0.0) || !sigma_min.is_finite() {
            return Err(Error::Configuration(
                "sigma_min must be positive and finite".into(),
            ));
        }
        if !(sigma_max > sigma_min) || !sigma_max.is_finite() {
            return Err(Error::Configuration(format!(
                "sigma_max ({sigma_max}) must be finite and exceed sigma_min ({sigma_min})"
            )));
        }
        Ok(Self {
            sigma_min,
            sigma_max,
        })
    }

    #[inline]
    pub fn sigma_at(&self, t: f32) -> f32 {
        self.sigma_min * (self.sigma_max / self.sigma_min).powf(t)
    }

    #[inline]
    pub fn diffusion_at(&self, t: f32) -> f32 {
        self.sigma_at(t) * (2.0 * (self.sigma_max / self.sigma_min).ln()).sqrt()
    }
}

impl ScoreModel for VeSde {
    fn sigma_min(&self) -> f32 {
        self.sigma_min
    }
    fn sigma_max(&self) -> f32 {
        self.sigma_max
    }
    fn sigma(&self, t: &ArrayView1<f32>) -> Array1<f32> {
        t.mapv(|ti| self.sigma_at(ti))
    }
    fn diffusion(&self, t: &ArrayView1<f32>, _x: &ArrayView4<f32>) -> Array1<f32> {
        t.mapv(|ti| self.diffusion_at(ti))
    }
    /// The bare schedule has no learned prior: its score is zero everywhere.
    fn score(&self, _t: &ArrayView1<f32>, x: &ArrayView4<f32>) -> Result<Array4<f32>> {
        Ok(Array4::zeros(x.raw_dim()))
    }
}

/// Isotropic Gaussian data prior \(\mathcal N(\mu, s^2 I)\) under a VE schedule.
///
/// The perturbed marginal is \(\mathcal N(\mu, (s^2 + \sigma(t)^2) I)\), so the exact score is
/// \(-(x - \mu) / (s^2 + \sigma(t)^2)\).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianPrior {
    pub sde: VeSde,
    pub mean: f32,
    pub std: f32,
}

impl GaussianPrior {
    pub fn new(sde: VeSde, mean: f32, std: f32) -> Result<Self> {
        if !(std > 0.0) || !std.is_finite() || !mean.is_finite() {
            return Err(Error::Configuration(
                "prior std must be positive and mean finite".into(),
            ));
        }
        Ok(Self { sde, mean, std })
    }
}

impl ScoreModel for GaussianPrior {
    fn sigma_min(&self) -> f32 {
        self.sde.sigma_min
    }
    fn sigma_max(&self) -> f32 {
        self.sde.sigma_max
    }
    fn sigma(&self, t: &ArrayView1<f32>) -> Array1<f32> {
        self.sde.sigma(t)
    }
    fn diffusion(&self, t: &ArrayView1<f32>, x: &ArrayView4<f32>) -> Array1<f32> {
        self.sde.diffusion(t, x)
    }
    fn score(&self, t: &ArrayView1<f32>, x: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let b = x.dim().0;
        if t.len() != b {
            return Err(Error::ShapeMismatch(format!(
                "time batch has {} entries but x has batch {b}",
                t.len()
            )));
        }
        let mut out = x.to_owned();
        for (bi, mut xb) in out.outer_iter_mut().enumerate() {
            let s = self.sde.sigma_at(t[bi]);
            let var = self.std * self.std + s * s;
            xb.mapv_inplace(|v| -(v - self.mean) / var);
        }
        Ok(out)
    }
}
