//! Channel noise model: correlated noise synthesis, covariance estimation
//! and prewhitening
//!
//! Noise samples live on the channel axis (last axis, Fortran order). The
//! decorrelation matrix is the conjugated inverse Cholesky factor of the
//! covariance, so prewhitened channels have unit-variance uncorrelated
//! noise.

use num_complex::Complex64;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{ReconError, Result};
use crate::linalg;

/// Generate complex Gaussian noise with the given channel covariance
///
/// Each location receives an i.i.d. complex standard normal channel vector
/// (variance 1/2 per real component) multiplied by the Cholesky factor of
/// `rn`. Output shape is `[nx, ny, nc]`. The RNG is caller-supplied so
/// simulations are reproducible from a seed.
pub fn generate_correlated_noise(
    nx: usize,
    ny: usize,
    rn: &[Complex64],
    nc: usize,
    rng: &mut impl Rng,
) -> Result<Vec<Complex64>> {
    let l = linalg::cholesky(rn, nc)?;
    let inv_sqrt2 = 1.0 / 2.0_f64.sqrt();

    let n_loc = nx * ny;
    let mut white = vec![Complex64::new(0.0, 0.0); nc];
    let mut out = vec![Complex64::new(0.0, 0.0); n_loc * nc];
    for loc in 0..n_loc {
        for w in white.iter_mut() {
            let re: f64 = rng.sample(StandardNormal);
            let im: f64 = rng.sample(StandardNormal);
            *w = Complex64::new(re * inv_sqrt2, im * inv_sqrt2);
        }
        for c in 0..nc {
            let mut s = Complex64::new(0.0, 0.0);
            // L is lower triangular
            for k in 0..=c {
                s += l[c + k * nc] * white[k];
            }
            out[loc + c * n_loc] = s;
        }
    }
    Ok(out)
}

/// Estimate a channel covariance matrix from noise samples
///
/// `samples` is `[nSamples, nc]` in Fortran order. Returns
/// `Rn[i, j] = sum_n s[n, i] * conj(s[n, j]) / nSamples`.
pub fn estimate_covariance_matrix(
    samples: &[Complex64],
    n_samples: usize,
    nc: usize,
) -> Result<Vec<Complex64>> {
    if samples.len() != n_samples * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "sample buffer has {} elements, expected {} x {}",
            samples.len(),
            n_samples,
            nc
        )));
    }
    if n_samples == 0 {
        return Err(ReconError::InvalidArgument(
            "covariance estimate needs at least one sample".into(),
        ));
    }
    let mut rn = vec![Complex64::new(0.0, 0.0); nc * nc];
    for j in 0..nc {
        for i in 0..nc {
            let mut s = Complex64::new(0.0, 0.0);
            for n in 0..n_samples {
                s += samples[n + i * n_samples] * samples[n + j * n_samples].conj();
            }
            rn[i + j * nc] = s / n_samples as f64;
        }
    }
    Ok(rn)
}

/// Estimate the noise covariance between two channels
pub fn estimate_covariance(channel1: &[Complex64], channel2: &[Complex64]) -> Result<Complex64> {
    if channel1.len() != channel2.len() || channel1.is_empty() {
        return Err(ReconError::ShapeMismatch(format!(
            "channel sample counts differ or are empty: {} vs {}",
            channel1.len(),
            channel2.len()
        )));
    }
    let s: Complex64 = channel1
        .iter()
        .zip(channel2.iter())
        .map(|(a, b)| a * b.conj())
        .sum();
    Ok(s / channel1.len() as f64)
}

/// Compute the prewhitening matrix `conj(inv(chol(Rn)))`
pub fn compute_decorrelation_matrix(rn: &[Complex64], nc: usize) -> Result<Vec<Complex64>> {
    let l = linalg::cholesky(rn, nc)?;
    let inv = linalg::invert_lower(&l, nc)?;
    Ok(inv.iter().map(|v| v.conj()).collect())
}

/// Apply a decorrelation matrix to the channel axis of an image stack
///
/// `data` is `[nLoc, nc]` (any image shape flattened location-first);
/// each location's channel vector `v` becomes `D * v`.
pub fn apply_decorrelation(
    data: &[Complex64],
    n_loc: usize,
    nc: usize,
    dmtx: &[Complex64],
) -> Result<Vec<Complex64>> {
    if data.len() != n_loc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "data has {} elements, expected {} x {}",
            data.len(),
            n_loc,
            nc
        )));
    }
    if dmtx.len() != nc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "decorrelation matrix has {} elements, expected {n} x {n}",
            dmtx.len(),
            n = nc
        )));
    }
    let mut out = vec![Complex64::new(0.0, 0.0); data.len()];
    for loc in 0..n_loc {
        for c in 0..nc {
            let mut s = Complex64::new(0.0, 0.0);
            for k in 0..nc {
                s += dmtx[c + k * nc] * data[loc + k * n_loc];
            }
            out[loc + c * n_loc] = s;
        }
    }
    Ok(out)
}

/// Per-location noise amplification of a channel combination
///
/// For each location's weight row `u`, returns `sqrt(|u * Rn * uᴴ|)`.
/// `rn = None` means identity covariance.
pub fn compute_noise_amplification(
    weights: &[Complex64],
    n_loc: usize,
    nc: usize,
    rn: Option<&[Complex64]>,
) -> Result<Vec<f64>> {
    if weights.len() != n_loc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "weights have {} elements, expected {} x {}",
            weights.len(),
            n_loc,
            nc
        )));
    }
    if let Some(rn) = rn {
        if rn.len() != nc * nc {
            return Err(ReconError::ShapeMismatch(format!(
                "covariance has {} elements, expected {n} x {n}",
                rn.len(),
                n = nc
            )));
        }
    }

    let mut amp = vec![0.0; n_loc];
    for loc in 0..n_loc {
        let mut quad = Complex64::new(0.0, 0.0);
        match rn {
            None => {
                for c in 0..nc {
                    quad += Complex64::new(weights[loc + c * n_loc].norm_sqr(), 0.0);
                }
            }
            Some(rn) => {
                for j in 0..nc {
                    let mut urn = Complex64::new(0.0, 0.0);
                    for k in 0..nc {
                        urn += weights[loc + k * n_loc] * rn[k + j * nc];
                    }
                    quad += urn * weights[loc + j * n_loc].conj();
                }
            }
        }
        amp[loc] = quad.norm().sqrt();
    }
    Ok(amp)
}
