//! Fixed-step Euler–Maruyama for the reverse-time SDE.
//!
//! The reverse-time SDE of a score-based model with drift-free forward process is
//! \[
//! dx = -g(t)^2 \, \nabla_x \log p_t(x)\, dt + g(t)\, d\bar w,
//! \]
//! integrated from `t_start` down to `0`. The discretization is
//! \[
//! x \leftarrow x - g^2\, s(x, t)\, \Delta t + g \sqrt{|\Delta t|}\, z, \qquad z \sim \mathcal N(0, I),
//! \]
//! with \(\Delta t < 0\).
//!
//! We keep this module tiny and deterministic given its noise: no adaptive stepping, no hidden
//! tolerances. The score is whatever the caller's closure returns.

use crate::{Error, Result};
use ndarray::{Array1, Array4, ArrayView4, Axis, Zip};
use std::ops::ControlFlow;

/// Drift ingredients at one step: the total score and the diffusion coefficient per batch element.
#[derive(Debug, Clone)]
pub struct Coefficients {
    /// \(s(x, t)\), same shape as the state.
    pub score: Array4<f32>,
    /// \(g(t)\), one value per batch element.
    pub g: Array1<f32>,
}

/// What an observer sees after each step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    /// Zero-based step index.
    pub step: usize,
    /// Time at which the coefficients were evaluated.
    pub t: f32,
    /// Largest absolute update applied in this step.
    pub max_abs_dx: f32,
}

/// `num_steps + 1` times from `t_start` down to exactly `0`.
///
/// Point `k` is `t_start * (1 - k / num_steps)`, computed in `f64`, so the grid is
/// non-increasing and its last entry is `0.0` bit for bit.
pub fn reverse_time_grid(t_start: f32, num_steps: usize) -> Result<Vec<f32>> {
    if num_steps == 0 {
        return Err(Error::Configuration("num_steps must be >= 1".into()));
    }
    if !(t_start > 0.0 && t_start <= 1.0) {
        return Err(Error::Configuration(format!(
            "t_start must lie in (0, 1], got {t_start}"
        )));
    }
    let n = num_steps as f64;
    let t0 = t_start as f64;
    Ok((0..=num_steps)
        .map(|k| (t0 * (1.0 - k as f64 / n)) as f32)
        .collect())
}

/// Integrate the reverse-time SDE over `grid` with a fixed step `dt < 0`.
///
/// Step `k` evaluates the coefficients at `grid[k]` and moves the state toward `grid[k + 1]`,
/// so a grid of `N + 1` points performs exactly `N` steps.
///
/// - `coefficients(x, t)`: score and diffusion at the current state
/// - `noise(z)`: fills `z` with the standard Gaussian draw for this step
/// - `observe(info, x)`: called after each step; `Break` cancels with [`Error::Cancelled`]
///
/// The state is checked after every step; any non-finite entry aborts with
/// [`Error::NumericalInstability`].
pub fn integrate_reverse_em<F, N, O>(
    x0: &ArrayView4<f32>,
    grid: &[f32],
    dt: f32,
    mut coefficients: F,
    mut noise: N,
    mut observe: O,
) -> Result<Array4<f32>>
where
    F: FnMut(&ArrayView4<f32>, f32) -> Result<Coefficients>,
    N: FnMut(&mut Array4<f32>),
    O: FnMut(StepInfo, &ArrayView4<f32>) -> ControlFlow<()>,
{
    if grid.len() < 2 {
        return Err(Error::Configuration(
            "time grid needs at least two points".into(),
        ));
    }
    if !(dt < 0.0) || !dt.is_finite() {
        return Err(Error::Configuration(format!(
            "reverse-time step must be negative and finite, got {dt}"
        )));
    }

    let b = x0.len_of(Axis(0));
    let sqrt_dt = dt.abs().sqrt();
    let mut x = x0.to_owned();
    let mut z = Array4::<f32>::zeros(x.raw_dim());

    for (step, &t) in grid[..grid.len() - 1].iter().enumerate() {
        noise(&mut z);

        let Coefficients { score, g } = coefficients(&x.view(), t)?;
        if score.raw_dim() != x.raw_dim() {
            return Err(Error::ShapeMismatch(format!(
                "score has shape {:?}, state has {:?}",
                score.shape(),
                x.shape()
            )));
        }
        if g.len() != b {
            return Err(Error::ShapeMismatch(format!(
                "diffusion has {} entries for batch {b}",
                g.len()
            )));
        }
        if let Some(bad) = g.iter().find(|v| !v.is_finite()) {
            return Err(Error::NumericalInstability(format!(
                "diffusion coefficient {bad} at step {step} (t = {t})"
            )));
        }

        let mut max_abs_dx = 0.0f32;
        for (bi, ((mut xb, sb), zb)) in x
            .outer_iter_mut()
            .zip(score.outer_iter())
            .zip(z.outer_iter())
            .enumerate()
        {
            let gb = g[bi];
            let g2 = gb * gb;
            Zip::from(&mut xb).and(&sb).and(&zb).for_each(|xv, &sv, &zv| {
                let dx = -g2 * sv * dt + gb * sqrt_dt * zv;
                *xv += dx;
                max_abs_dx = max_abs_dx.max(dx.abs());
            });
        }

        if x.iter().any(|v| !v.is_finite()) {
            return Err(Error::NumericalInstability(format!(
                "state became non-finite at step {step} (t = {t})"
            )));
        }

        let info = StepInfo {
            step,
            t,
            max_abs_dx,
        };
        if let ControlFlow::Break(()) = observe(info, &x.view()) {
            return Err(Error::Cancelled { step });
        }
    }

    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn no_noise(z: &mut Array4<f32>) {
        z.fill(0.0);
    }

    fn keep_going(_: StepInfo, _: &ArrayView4<f32>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    #[test]
    fn grid_has_expected_shape() {
        let g = reverse_time_grid(0.8, 7).unwrap();
        assert_eq!(g.len(), 8);
        assert_eq!(g[0], 0.8);
        assert_eq!(g[7], 0.0);
        assert!(g.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn grid_rejects_bad_inputs() {
        assert!(matches!(reverse_time_grid(1.0, 0), Err(Error::Configuration(_))));
        assert!(matches!(reverse_time_grid(0.0, 5), Err(Error::Configuration(_))));
        assert!(matches!(reverse_time_grid(1.5, 5), Err(Error::Configuration(_))));
        assert!(matches!(reverse_time_grid(f32::NAN, 5), Err(Error::Configuration(_))));
    }

    #[test]
    fn pure_noise_has_unit_variance_over_unit_time() {
        // Zero score, g = 1: x_N - x_0 is a sum of N increments of variance |dt|.
        let steps = 50usize;
        let grid = reverse_time_grid(1.0, steps).unwrap();
        let dt = -1.0 / steps as f32;
        let x0 = Array4::<f32>::zeros((4, 2, 32, 32));
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        let x = integrate_reverse_em(
            &x0.view(),
            &grid,
            dt,
            |x, _t| {
                Ok(Coefficients {
                    score: Array4::zeros(x.raw_dim()),
                    g: Array1::ones(x.len_of(Axis(0))),
                })
            },
            |z| z.iter_mut().for_each(|v| *v = StandardNormal.sample(&mut rng)),
            keep_going,
        )
        .unwrap();

        let n = x.len() as f64;
        let var = x.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / n;
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }

    #[test]
    fn observer_can_cancel() {
        let grid = reverse_time_grid(1.0, 10).unwrap();
        let x0 = Array4::<f32>::zeros((1, 1, 2, 2));
        let err = integrate_reverse_em(
            &x0.view(),
            &grid,
            -0.1,
            |x, _| {
                Ok(Coefficients {
                    score: Array4::zeros(x.raw_dim()),
                    g: Array1::ones(1),
                })
            },
            no_noise,
            |info, _| {
                if info.step == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled { step: 3 }));
    }

    #[test]
    fn non_finite_state_is_reported() {
        let grid = reverse_time_grid(1.0, 4).unwrap();
        let x0 = Array4::<f32>::ones((1, 1, 2, 2));
        let err = integrate_reverse_em(
            &x0.view(),
            &grid,
            -0.25,
            |x, _| {
                Ok(Coefficients {
                    score: Array4::from_elem(x.raw_dim(), f32::INFINITY),
                    g: Array1::ones(1),
                })
            },
            no_noise,
            keep_going,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NumericalInstability(_)), "{err}");
    }

    #[test]
    fn score_shape_is_checked() {
        let grid = reverse_time_grid(1.0, 2).unwrap();
        let x0 = Array4::<f32>::ones((2, 1, 2, 2));
        let err = integrate_reverse_em(
            &x0.view(),
            &grid,
            -0.5,
            |_, _| {
                Ok(Coefficients {
                    score: Array4::zeros((1, 1, 2, 2)),
                    g: Array1::ones(2),
                })
            },
            no_noise,
            keep_going,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_constant_score_without_noise_is_exact(
            steps in 1usize..200,
            t_start in 0.05f32..1.0,
            g in 0.0f32..3.0,
            c in prop::collection::vec(-5.0f32..5.0, 8),
            x0 in prop::collection::vec(-10.0f32..10.0, 8),
        ) {
            let grid = reverse_time_grid(t_start, steps).unwrap();
            let dt = -1.0 / steps as f32;
            let x0 = Array4::from_shape_vec((2, 1, 2, 2), x0).unwrap();
            let c = Array4::from_shape_vec((2, 1, 2, 2), c).unwrap();

            let x = integrate_reverse_em(
                &x0.view(),
                &grid,
                dt,
                |_, _| Ok(Coefficients { score: c.clone(), g: Array1::from_elem(2, g) }),
                no_noise,
                keep_going,
            ).unwrap();

            // x_N = x_0 - g^2 c dt N = x_0 + g^2 c
            for (i, (&xv, (&x0v, &cv))) in x.iter().zip(x0.iter().zip(c.iter())).enumerate() {
                let expected = x0v + g * g * cv;
                let tol = 1e-2 + 1e-5 * expected.abs();
                prop_assert!((xv - expected).abs() <= tol, "mismatch at {i}: {xv} vs {expected}");
            }
        }
    }
}
