//! Sweeps over the likelihood `noise_scale`.
//!
//! Guidance strength is the main knob of the sampler, so it is usually evaluated on a grid.
//! Every point of the sweep restarts from the same `x_init` with the same seed, so differences
//! between points come from `noise_scale` alone.

use crate::metrics::{modal_power_deviation, ModalDeviation};
use crate::operator::ForwardOperator;
use crate::sampler::{GuidedSampler, SamplerConfig};
use crate::score::ScoreModel;
use crate::{Error, Result};
use ndarray::{Array4, ArrayView3, ArrayView4};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// `n` evenly spaced values from `start` to `end` inclusive (like `numpy.linspace`).
pub fn linspace(start: f32, end: f32, n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end as f64 - start as f64) / (n - 1) as f64;
            (0..n)
                .map(|i| {
                    if i == n - 1 {
                        end
                    } else {
                        (start as f64 + step * i as f64) as f32
                    }
                })
                .collect()
        }
    }
}

/// One point of a noise-scale sweep.
#[derive(Debug, Clone)]
pub struct SweepPoint {
    pub noise_scale: f32,
    pub sample: Array4<f32>,
    /// Modal power deviation of the sample against the observation.
    pub deviation: ModalDeviation,
    /// RMS of `A x - y`.
    pub modal_residual: f32,
}

/// Run the sampler once per entry of `scales`, each with `ChaCha8Rng::seed_from_u64(seed)`.
///
/// `base` supplies every other parameter. The first failing scale aborts the sweep.
pub fn sweep_noise_scale<M: ScoreModel>(
    base: &SamplerConfig,
    op: &ForwardOperator,
    model: &M,
    x_init: &ArrayView4<f32>,
    y: &ArrayView3<f32>,
    scales: &[f32],
    seed: u64,
) -> Result<Vec<SweepPoint>> {
    if scales.is_empty() {
        return Err(Error::Configuration("sweep needs at least one noise_scale".into()));
    }

    let mut out = Vec::with_capacity(scales.len());
    for &noise_scale in scales {
        let cfg = SamplerConfig {
            noise_scale,
            ..*base
        };
        let point = GuidedSampler::new(cfg, op.clone(), model).and_then(|sampler| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let sample = sampler.sample(x_init, y, &mut rng)?;
            let modes = op.project_batch(&sample.view())?;
            let deviation = modal_power_deviation(&modes.view(), y)?;
            let modal_residual = sampler.modal_residual(&sample.view(), y)?;
            Ok(SweepPoint {
                noise_scale,
                sample,
                deviation,
                modal_residual,
            })
        });
        match point {
            Ok(p) => {
                tracing::info!(
                    noise_scale,
                    modal_residual = p.modal_residual,
                    "sweep point done"
                );
                out.push(p);
            }
            Err(e) => {
                tracing::warn!(noise_scale, error = %e, "sweep point failed");
                return Err(e);
            }
        }
    }
    Ok(out)
}
