//! Measurement covariance and the closed-form likelihood score.
//!
//! For one batch element with channels `c = 1..C`, observation `y_c` (length `M`) and state
//! `x_c` (`H × W`), the log-likelihood used for guidance is
//!
//! \[
//! \ell(x) = -\tfrac12 \sum_c (y_c - A x_c)^\top \Sigma_t^{-1} (y_c - A x_c),
//! \qquad \Sigma_t = \eta^2 I_M + A A^\dagger \sigma(t)^2 / s .
//! \]
//!
//! The covariance is the same for every channel (block diagonal across channels). Its gradient
//! with respect to `x_c` is
//!
//! \[
//! \nabla_{x_c} \ell = \tfrac12 A^\top (\Sigma_t^{-1} + \Sigma_t^{-\top}) (y_c - A x_c),
//! \]
//!
//! which we evaluate directly instead of differentiating \(\ell\) numerically.

use crate::linalg::invert;
use crate::operator::ForwardOperator;
use crate::{Error, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4};

/// Builds \(\Sigma_t\) for a given noise level and inverts it.
#[derive(Debug, Clone)]
pub struct MeasurementCovariance {
    aa_t: Array2<f64>,
    eta: f64,
    noise_scale: f64,
}

impl MeasurementCovariance {
    pub fn new(aa_t: &ArrayView2<f32>, eta: f32, noise_scale: f32) -> Result<Self> {
        if aa_t.nrows() != aa_t.ncols() {
            return Err(Error::ShapeMismatch(format!(
                "aa_t must be square, got {:?}",
                aa_t.dim()
            )));
        }
        if !(eta >= 0.0) || !eta.is_finite() {
            return Err(Error::Configuration("eta must be finite and >= 0".into()));
        }
        if !(noise_scale > 0.0) || !noise_scale.is_finite() {
            return Err(Error::Configuration(
                "noise_scale must be positive and finite".into(),
            ));
        }
        Ok(Self {
            aa_t: aa_t.mapv(f64::from),
            eta: eta as f64,
            noise_scale: noise_scale as f64,
        })
    }

    pub fn for_operator(op: &ForwardOperator, eta: f32, noise_scale: f32) -> Result<Self> {
        Self::new(&op.aa_t().view(), eta, noise_scale)
    }

    pub fn dim(&self) -> usize {
        self.aa_t.nrows()
    }

    /// \(\Sigma_t = \eta^2 I + A A^\dagger \sigma_t^2 / s\).
    pub fn at(&self, sig_t: f32) -> Array2<f64> {
        let sig = sig_t as f64;
        let mut cov = &self.aa_t * (sig * sig / self.noise_scale);
        let e2 = self.eta * self.eta;
        for i in 0..self.dim() {
            cov[[i, i]] += e2;
        }
        cov
    }

    /// \(\Sigma_t^{-1}\), or [`Error::NumericalInstability`] if it is singular or ill-conditioned.
    pub fn inverse_at(&self, sig_t: f32) -> Result<Array2<f32>> {
        if !sig_t.is_finite() {
            return Err(Error::NumericalInstability(format!(
                "noise level sigma(t) = {sig_t} is not finite"
            )));
        }
        let inv = invert(&self.at(sig_t).view()).map_err(|e| match e {
            Error::NumericalInstability(msg) => Error::NumericalInstability(format!(
                "measurement covariance at sigma(t) = {sig_t:.4e} (eta = {}): {msg}",
                self.eta
            )),
            other => other,
        })?;
        Ok(inv.mapv(|v| v as f32))
    }
}

/// Symmetric part \(\tfrac12 (S + S^\top)\) of an inverse covariance.
fn symmetrize(sigma_inv: &ArrayView2<f32>) -> Array2<f32> {
    (sigma_inv + &sigma_inv.t()) * 0.5
}

/// Log-likelihood \(\ell(x)\) of one batch element.
///
/// - `x`: `(C, H, W)`
/// - `y`: `(C, M)`
/// - `sigma_inv`: `(M, M)`
pub fn log_likelihood(
    op: &ForwardOperator,
    x: &ArrayView3<f32>,
    y: &ArrayView2<f32>,
    sigma_inv: &ArrayView2<f32>,
) -> f32 {
    let mut acc = 0.0f64;
    for (xc, yc) in x.outer_iter().zip(y.outer_iter()) {
        let r = &yc - &op.project(&xc);
        acc += r.dot(&sigma_inv.dot(&r)) as f64;
    }
    (-0.5 * acc) as f32
}

/// Gradient of [`log_likelihood`] with respect to `x`, shape `(C, H, W)`.
///
/// Pixels outside the pupil get zero: the likelihood does not see them.
pub fn likelihood_score(
    op: &ForwardOperator,
    x: &ArrayView3<f32>,
    y: &ArrayView2<f32>,
    sigma_inv: &ArrayView2<f32>,
) -> Array3<f32> {
    let s_sym = symmetrize(sigma_inv);
    let mut out = Array3::<f32>::zeros(x.raw_dim());
    for ((xc, yc), mut oc) in x.outer_iter().zip(y.outer_iter()).zip(out.outer_iter_mut()) {
        let r = &yc - &op.project(&xc);
        let w = s_sym.dot(&r);
        oc.assign(&op.adjoint(&w.view()));
    }
    out
}

/// Per-batch-element likelihood score for a `(B, C, H, W)` state.
///
/// Each element gets its own \(\Sigma_t^{-1}\) from `sig_t[b]`; consecutive elements with the
/// same noise level reuse the previous inverse.
pub fn batch_likelihood_score(
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
    if cov.dim() != op.num_modes() {
        return Err(Error::ShapeMismatch(format!(
            "covariance is {0}x{0} but the operator has {1} modes",
            cov.dim(),
            op.num_modes()
        )));
    }

    let mut out = Array4::<f32>::zeros(x.raw_dim());
    let mut cache: Option<(u32, Array2<f32>)> = None;
    for bi in 0..b {
        let bits = sig_t[bi].to_bits();
        if cache.as_ref().map(|(k, _)| *k) != Some(bits) {
            cache = Some((bits, cov.inverse_at(sig_t[bi])?));
        }
        if let Some((_, sigma_inv)) = &cache {
            let g = likelihood_score(
                op,
                &x.slice(s![bi, .., .., ..]),
                &y.slice(s![bi, .., ..]),
                &sigma_inv.view(),
            );
            out.slice_mut(s![bi, .., .., ..]).assign(&g);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{polynomial_modes, PupilMask};
    use ndarray::Array1;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn small_operator(num_modes: usize) -> ForwardOperator {
        let mask = PupilMask::circular(10).padded(1);
        let z = polynomial_modes(&mask, num_modes);
        ForwardOperator::from_modes(&z.view(), &mask).unwrap()
    }

    fn random_field(shape: (usize, usize, usize), seed: u64) -> Array3<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array3::from_shape_simple_fn(shape, || StandardNormal.sample(&mut rng))
    }

    #[test]
    fn closed_form_matches_finite_differences() {
        let op = small_operator(6);
        let (h, w) = op.field_shape();
        let x = random_field((2, h, w), 1);
        let y = random_field((1, 2, 6), 2).index_axis_move(ndarray::Axis(0), 0);
        let cov = MeasurementCovariance::for_operator(&op, 0.3, 5.0).unwrap();
        // Non-symmetric perturbation so the symmetrization is exercised.
        let mut s_inv = cov.inverse_at(0.7).unwrap();
        s_inv[[0, 1]] += 0.05;

        let g = likelihood_score(&op, &x.view(), &y.view(), &s_inv.view());

        let eps = 1e-2f32;
        let probes: Vec<(usize, usize, usize)> = op
            .valid_pixels()
            .iter()
            .step_by(7)
            .flat_map(|&(i, j)| [(0usize, i, j), (1usize, i, j)])
            .collect();
        for (c, i, j) in probes {
            let mut xp = x.clone();
            xp[[c, i, j]] += eps;
            let mut xm = x.clone();
            xm[[c, i, j]] -= eps;
            let fd = (log_likelihood(&op, &xp.view(), &y.view(), &s_inv.view())
                - log_likelihood(&op, &xm.view(), &y.view(), &s_inv.view()))
                / (2.0 * eps);
            let an = g[[c, i, j]];
            assert!(
                (fd - an).abs() <= 2e-2 * an.abs().max(1.0),
                "pixel ({i},{j}): fd={fd} analytic={an}"
            );
        }
    }

    #[test]
    fn gradient_vanishes_outside_pupil() {
        let op = small_operator(4);
        let (h, w) = op.field_shape();
        let x = random_field((1, h, w), 3);
        let y = Array2::<f32>::ones((1, 4));
        let s_inv = Array2::<f32>::eye(4);
        let g = likelihood_score(&op, &x.view(), &y.view(), &s_inv.view());
        assert_eq!(g[[0, 0, 0]], 0.0);
        assert_eq!(g[[0, h - 1, w - 1]], 0.0);
    }

    #[test]
    fn consistent_state_has_zero_gradient() {
        let op = small_operator(5);
        let c = Array1::from_vec(vec![0.3f32, -1.0, 0.2, 0.5, -0.1]);
        let field = op.reconstruct(&c.view()).unwrap();
        let x = field.insert_axis(ndarray::Axis(0));
        let y = c.insert_axis(ndarray::Axis(0));
        let cov = MeasurementCovariance::for_operator(&op, 0.1, 1.0).unwrap();
        let s_inv = cov.inverse_at(1.0).unwrap();
        let g = likelihood_score(&op, &x.view(), &y.view(), &s_inv.view());
        assert!(g.iter().all(|v| v.abs() < 1e-2), "max {:?}", g.iter().cloned().fold(0.0f32, f32::max));
    }

    #[test]
    fn singular_covariance_is_numerical_instability() {
        let op = small_operator(4);
        let cov = MeasurementCovariance::for_operator(&op, 0.0, 10.0).unwrap();
        let err = cov.inverse_at(0.0).unwrap_err();
        assert!(matches!(err, Error::NumericalInstability(_)), "{err}");
    }

    #[test]
    fn non_finite_sigma_is_numerical_instability() {
        let op = small_operator(4);
        let cov = MeasurementCovariance::for_operator(&op, 0.1, 10.0).unwrap();
        assert!(matches!(
            cov.inverse_at(f32::NAN),
            Err(Error::NumericalInstability(_))
        ));
    }

    #[test]
    fn eta_positive_is_invertible_across_schedule() {
        let op = small_operator(10);
        let cov = MeasurementCovariance::for_operator(&op, 0.05, 10.0).unwrap();
        let (s_min, s_max) = (0.01f32, 50.0f32);
        for k in 0..=40 {
            let u = k as f32 / 40.0;
            let sig = s_min * (s_max / s_min).powf(u);
            assert!(cov.inverse_at(sig).is_ok(), "sigma={sig}");
        }
        assert!(cov.inverse_at(0.0).is_ok());
    }

    #[test]
    fn likelihood_magnitude_scales_with_noise_scale_when_eta_is_zero() {
        // Sigma_t = aa_t * sig^2 / s, so |grad| is proportional to s.
        let op = small_operator(6);
        let (h, w) = op.field_shape();
        let x = random_field((1, h, w), 5);
        let y = Array2::<f32>::zeros((1, 6));

        let mut prev = 0.0f32;
        for &s in &[1.0f32, 5.0, 25.0, 125.0] {
            let cov = MeasurementCovariance::for_operator(&op, 0.0, s).unwrap();
            let s_inv = cov.inverse_at(1.0).unwrap();
            let g = likelihood_score(&op, &x.view(), &y.view(), &s_inv.view());
            let norm = g.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!(norm > prev, "noise_scale={s}: {norm} <= {prev}");
            prev = norm;
        }
    }

    #[test]
    fn batch_score_checks_observation_shape() {
        let op = small_operator(4);
        let (h, w) = op.field_shape();
        let cov = MeasurementCovariance::for_operator(&op, 0.1, 1.0).unwrap();
        let x = Array4::<f32>::zeros((2, 1, h, w));
        let y = Array3::<f32>::zeros((2, 1, 5));
        let sig = Array1::<f32>::ones(2);
        assert!(matches!(
            batch_likelihood_score(&op, &cov, &x.view(), &y.view(), &sig.view()),
            Err(Error::ShapeMismatch(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 24,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_batch_score_equals_per_element_score(
            b in 1usize..4,
            c in 1usize..3,
            seed in any::<u64>(),
            eta in 0.01f32..1.0,
        ) {
            let op = small_operator(5);
            let (h, w) = op.field_shape();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let x = Array4::from_shape_simple_fn((b, c, h, w), || StandardNormal.sample(&mut rng));
            let y = Array3::from_shape_simple_fn((b, c, 5), || StandardNormal.sample(&mut rng));
            let sig = Array1::from_shape_fn(b, |i| 0.1 + i as f32);
            let cov = MeasurementCovariance::for_operator(&op, eta, 3.0).unwrap();

            let batched = batch_likelihood_score(&op, &cov, &x.view(), &y.view(), &sig.view()).unwrap();
            for bi in 0..b {
                let s_inv = cov.inverse_at(sig[bi]).unwrap();
                let single = likelihood_score(
                    &op,
                    &x.slice(s![bi, .., .., ..]),
                    &y.slice(s![bi, .., ..]),
                    &s_inv.view(),
                );
                for (a, e) in batched.slice(s![bi, .., .., ..]).iter().zip(single.iter()) {
                    prop_assert_eq!(a.to_bits(), e.to_bits());
                }
            }
        }
    }
}
