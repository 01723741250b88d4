//! Guided reverse-diffusion posterior sampler.
//!
//! This module wires together:
//! - a pretrained prior ([`ScoreModel`]) for the noise schedule and the prior score,
//! - the forward operator and measurement covariance for the likelihood score,
//! - the fixed-step reverse-time integrator in [`crate::sde`].
//!
//! The contract is:
//! - the configuration is validated before any array is touched,
//! - deterministic given the noise (seeded RNG or explicit noise closure),
//! - a failed step aborts the whole run; there is no partial result and no silent fallback to
//!   prior-only sampling (that is `likelihood_weight = 0`, chosen explicitly).

use crate::likelihood::{batch_likelihood_score, MeasurementCovariance};
use crate::operator::ForwardOperator;
use crate::score::ScoreModel;
use crate::sde::{integrate_reverse_em, reverse_time_grid, Coefficients, StepInfo};
use crate::{Error, Result};
use ndarray::{Array1, Array3, Array4, ArrayView3, ArrayView4, Zip};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::ops::ControlFlow;

/// Upper bound on `num_steps`, so every run terminates in bounded time.
pub const MAX_NUM_STEPS: usize = 100_000;

/// Sampling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of Euler–Maruyama steps; `dt = -1 / num_steps`.
    pub num_steps: usize,
    /// Reverse-time start in `(0, 1]`.
    pub t_start: f32,
    /// Divides the prior-noise part of the measurement covariance.
    pub noise_scale: f32,
    /// Measurement-noise floor (standard deviation) added to the covariance diagonal.
    pub eta: f32,
    /// Expected batch size `B`.
    pub batch_size: usize,
    /// Expected channel count `C` (one channel per pupil image).
    pub channels: usize,
    /// Weight of the likelihood score; `0` samples from the prior alone.
    pub likelihood_weight: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_steps: 1_000,
            t_start: 1.0,
            noise_scale: 10.0,
            eta: 0.0,
            batch_size: 1,
            channels: 4,
            likelihood_weight: 1.0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 || self.num_steps > MAX_NUM_STEPS {
            return Err(Error::Configuration(format!(
                "num_steps must lie in 1..={MAX_NUM_STEPS}, got {}",
                self.num_steps
            )));
        }
        if !(self.t_start > 0.0 && self.t_start <= 1.0) {
            return Err(Error::Configuration(format!(
                "t_start must lie in (0, 1], got {}",
                self.t_start
            )));
        }
        if !(self.noise_scale > 0.0) || !self.noise_scale.is_finite() {
            return Err(Error::Configuration(format!(
                "noise_scale must be positive and finite, got {}",
                self.noise_scale
            )));
        }
        if !(self.eta >= 0.0) || !self.eta.is_finite() {
            return Err(Error::Configuration(format!(
                "eta must be finite and >= 0, got {}",
                self.eta
            )));
        }
        if self.batch_size == 0 || self.channels == 0 {
            return Err(Error::Configuration(
                "batch_size and channels must be >= 1".into(),
            ));
        }
        if !(self.likelihood_weight >= 0.0) || !self.likelihood_weight.is_finite() {
            return Err(Error::Configuration(format!(
                "likelihood_weight must be finite and >= 0, got {}",
                self.likelihood_weight
            )));
        }
        Ok(())
    }

    /// The constant reverse-time step `-1 / num_steps`.
    pub fn dt(&self) -> f32 {
        -1.0 / self.num_steps as f32
    }
}

/// Per-step summary passed to observers of [`GuidedSampler::sample_observed`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub t: f32,
    /// Noise level of the first batch element (all elements share `t`).
    pub sigma: f32,
    pub max_abs_dx: f32,
}

/// Euler–Maruyama sampler for the reverse-time SDE with likelihood guidance.
#[derive(Debug, Clone)]
pub struct GuidedSampler<M> {
    config: SamplerConfig,
    op: ForwardOperator,
    cov: MeasurementCovariance,
    model: M,
    grid: Vec<f32>,
}

impl<M: ScoreModel> GuidedSampler<M> {
    /// Validate everything that can be validated up front.
    ///
    /// Fails with [`Error::Configuration`] for invalid parameters or an invalid noise schedule.
    /// Input shapes are checked per call, before the first step.
    pub fn new(config: SamplerConfig, op: ForwardOperator, model: M) -> Result<Self> {
        config.validate()?;
        let (s_min, s_max) = (model.sigma_min(), model.sigma_max());
        if !(s_min < s_max) || !s_min.is_finite() || !s_max.is_finite() {
            return Err(Error::Configuration(format!(
                "noise schedule needs finite sigma_min < sigma_max, got {s_min} and {s_max}"
            )));
        }
        let cov = MeasurementCovariance::for_operator(&op, config.eta, config.noise_scale)?;
        let grid = reverse_time_grid(config.t_start, config.num_steps)?;
        Ok(Self {
            config,
            op,
            cov,
            model,
            grid,
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn operator(&self) -> &ForwardOperator {
        &self.op
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// The `num_steps + 1` reverse times, from `t_start` to `0`.
    pub fn time_grid(&self) -> &[f32] {
        &self.grid
    }

    /// Modal observation `y = A x` of a low-resolution batch.
    pub fn observe(&self, lr: &ArrayView4<f32>) -> Result<Array3<f32>> {
        self.op.project_batch(lr)
    }

    /// Draw one posterior sample per batch element, starting from `x_init`.
    ///
    /// The Brownian increments come from `rng` (standard Gaussian). Two calls with equally
    /// seeded generators return bit-identical samples.
    pub fn sample<R>(
        &self,
        x_init: &ArrayView4<f32>,
        y: &ArrayView3<f32>,
        rng: &mut R,
    ) -> Result<Array4<f32>>
    where
        R: rand::Rng + ?Sized,
    {
        self.sample_with_noise(x_init, y, |z| {
            z.iter_mut().for_each(|v| *v = StandardNormal.sample(&mut *rng));
        })
    }

    /// Like [`Self::sample`], but the caller fills the standard-normal draw `z` of every step.
    ///
    /// Filling with zeros gives the deterministic drift-only trajectory.
    pub fn sample_with_noise(
        &self,
        x_init: &ArrayView4<f32>,
        y: &ArrayView3<f32>,
        noise: impl FnMut(&mut Array4<f32>),
    ) -> Result<Array4<f32>> {
        self.sample_observed(x_init, y, noise, |_, _| ControlFlow::Continue(()))
    }

    /// Full-control entry point: explicit noise and a per-step observer.
    ///
    /// The observer runs after each step; returning `ControlFlow::Break(())` stops the run with
    /// [`Error::Cancelled`].
    pub fn sample_observed(
        &self,
        x_init: &ArrayView4<f32>,
        y: &ArrayView3<f32>,
        noise: impl FnMut(&mut Array4<f32>),
        mut observer: impl FnMut(StepReport, &ArrayView4<f32>) -> ControlFlow<()>,
    ) -> Result<Array4<f32>> {
        self.check_inputs(x_init, y)?;

        let cfg = &self.config;
        let b = x_init.dim().0;
        let log_every = (cfg.num_steps / 10).max(1);
        tracing::info!(
            num_steps = cfg.num_steps,
            t_start = cfg.t_start,
            noise_scale = cfg.noise_scale,
            eta = cfg.eta,
            batch = b,
            channels = cfg.channels,
            modes = self.op.num_modes(),
            "starting guided reverse diffusion"
        );

        let last_sigma = Cell::new(f32::NAN);
        let out = integrate_reverse_em(
            x_init,
            &self.grid,
            cfg.dt(),
            |x, t| {
                let (coeffs, sigma) = self.coefficients(x, y, t)?;
                last_sigma.set(sigma);
                Ok(coeffs)
            },
            noise,
            |info: StepInfo, x| {
                let report = StepReport {
                    step: info.step,
                    t: info.t,
                    sigma: last_sigma.get(),
                    max_abs_dx: info.max_abs_dx,
                };
                if info.step % log_every == 0 || info.step + 1 == cfg.num_steps {
                    tracing::debug!(
                        step = report.step,
                        t = report.t,
                        sigma = report.sigma,
                        max_abs_dx = report.max_abs_dx,
                        "reverse diffusion step"
                    );
                }
                observer(report, x)
            },
        );

        match &out {
            Ok(x) => {
                let residual = self.modal_residual(&x.view(), y)?;
                tracing::info!(modal_rms_residual = residual, "guided reverse diffusion done");
            }
            Err(e) => tracing::debug!(error = %e, "guided reverse diffusion aborted"),
        }
        out
    }

    /// Score and diffusion at `(x, t)`; also returns `sigma(t)` of the first element.
    fn coefficients(
        &self,
        x: &ArrayView4<f32>,
        y: &ArrayView3<f32>,
        t: f32,
    ) -> Result<(Coefficients, f32)> {
        let b = x.dim().0;
        let t_batch = Array1::from_elem(b, t);

        let g = self.model.diffusion(&t_batch.view(), x);
        let sig = self.model.sigma(&t_batch.view());
        if sig.len() != b {
            return Err(Error::ShapeMismatch(format!(
                "sigma(t) returned {} values for batch {b}",
                sig.len()
            )));
        }

        let mut score = self.model.score(&t_batch.view(), x)?;
        if score.raw_dim() != x.raw_dim() {
            return Err(Error::ShapeMismatch(format!(
                "prior score has shape {:?}, state has {:?}",
                score.shape(),
                x.shape()
            )));
        }

        let w = self.config.likelihood_weight;
        if w > 0.0 {
            let lik = batch_likelihood_score(&self.op, &self.cov, x, y, &sig.view())?;
            Zip::from(&mut score)
                .and(&lik)
                .for_each(|s, &l| *s += w * l);
        }

        Ok((Coefficients { score, g }, sig[0]))
    }

    fn check_inputs(&self, x_init: &ArrayView4<f32>, y: &ArrayView3<f32>) -> Result<()> {
        let (b, c, h, w) = x_init.dim();
        if b != self.config.batch_size || c != self.config.channels {
            return Err(Error::ShapeMismatch(format!(
                "x_init has batch {b} and {c} channels, config expects {} and {}",
                self.config.batch_size, self.config.channels
            )));
        }
        self.op.check_field_shape(h, w)?;
        let m = self.op.num_modes();
        if y.dim() != (b, c, m) {
            return Err(Error::ShapeMismatch(format!(
                "observation is {:?}, expected ({b}, {c}, {m})",
                y.dim()
            )));
        }
        if x_init.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(Error::NumericalInstability(
                "inputs contain non-finite values".into(),
            ));
        }
        Ok(())
    }

    /// Root-mean-square of `A x - y` over batch, channels and modes.
    pub fn modal_residual(&self, x: &ArrayView4<f32>, y: &ArrayView3<f32>) -> Result<f32> {
        let ax = self.op.project_batch(x)?;
        if ax.dim() != y.dim() {
            return Err(Error::ShapeMismatch(format!(
                "projected state is {:?}, observation is {:?}",
                ax.dim(),
                y.dim()
            )));
        }
        let n = ax.len().max(1) as f64;
        let ss: f64 = ax
            .iter()
            .zip(y.iter())
            .map(|(&a, &o)| {
                let r = (a - o) as f64;
                r * r
            })
            .sum();
        Ok((ss / n).sqrt() as f32)
    }
}
