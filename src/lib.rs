//! # aodiff
//!
//! Posterior sampling of wavefront-sensor (WFS) pupil images with a score-based diffusion prior.
//!
//! This crate is intentionally small:
//!
//! - it implements the **guided reverse-diffusion sampler** (Euler–Maruyama on the reverse-time
//!   SDE, with a likelihood-gradient correction in modal space),
//! - the score network is **not** part of the crate: it is an injected [`score::ScoreModel`],
//! - it does not provide a CLI or experiment runner.
//!
//! ## Public invariants (must not change)
//!
//! - **Randomness is explicit**: sampling takes an `rng` (or a noise closure). No global RNG.
//! - **No ambient state**: operator matrices, the score model and the config are constructor
//!   arguments. Nothing is read from module-level arrays.
//! - **Failures are loud**: a singular covariance or a non-finite state aborts the run with
//!   [`Error::NumericalInstability`]; no NaN is ever returned as a sample.
//!
//! ## How this maps to the math
//!
//! With forward operator \(A\) (pupil restriction followed by the mode decomposition), the
//! per-step measurement covariance is
//! \[
//! \Sigma_t = \eta^2 I_M + A A^\dagger \,\sigma(t)^2 / s,
//! \]
//! where \(s\) is the `noise_scale`. The likelihood score is the gradient of
//! \(-\tfrac12 (y - Ax)^\top \Sigma_t^{-1} (y - Ax)\), computed in closed form
//! (see [`likelihood`]), and the update is
//! \[
//! x \leftarrow x - g^2 (\nabla \log p(y \mid x) + s_\theta(x, t))\,\Delta t + g\,\Delta w,
//! \quad \Delta t = -1/N.
//! \]
//!
//! ## Module map
//!
//! - `sampler`: config, validation and the guided posterior sampler (main implementation)
//! - `sde`: reverse-time grid and the fixed-step Euler–Maruyama integrator
//! - `operator`: pupil mask, valid-pixel index set, mode decomposition and round-trip matrix
//! - `likelihood`: per-step measurement covariance and the closed-form likelihood gradient
//! - `linalg`: small dense `f64` helpers (inversion, pseudo-inverse) used by the two above
//! - `score`: the score-model seam, a VE noise schedule and an analytic Gaussian prior
//! - `metrics`: radial power spectra and modal power deviation used to evaluate samples
//! - `sweep`: run the sampler across a grid of `noise_scale` values
//! - `io`: `.npy` persistence for sample batches and operator artifacts
//!
//! With the `burn` feature, `burn_grad` recomputes the likelihood gradient with Burn autodiff
//! so the closed form can be checked against it.

pub mod io;
pub mod likelihood;
pub mod linalg;
pub mod metrics;
pub mod operator;
pub mod sampler;
pub mod score;
pub mod sde;
pub mod sweep;

#[cfg(feature = "burn")]
pub mod burn_grad;

/// aodiff error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("sampling cancelled at step {step}")]
    Cancelled { step: usize },
    #[error("failed to read array: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),
    #[error("failed to write array: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),
}

pub type Result<T> = std::result::Result<T, Error>;
