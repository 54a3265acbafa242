//! Channel combination: noise-optimal combination maps, root sum of
//! squares and shading normalization
//!
//! A channel combination map (ccm) collapses channel-by-channel images to
//! a composite as `composite(loc) = sum_c ccm[loc, c] * im[loc, c]`.

use num_complex::Complex64;

use crate::error::{ReconError, Result};
use crate::linalg;

/// Strategy for deriving channel combination maps from coil images
///
/// Implemented by the McKenzie and Walsh sensitivity estimators and the
/// data-driven virtual-coil method, so reconstruction drivers can take the
/// method as a parameter.
pub trait CcmMethod {
    /// Compute ccm of shape `[nx, ny, nc]` from coil images of the same
    /// shape.
    fn compute_ccm(
        &self,
        im: &[Complex64],
        nx: usize,
        ny: usize,
        nc: usize,
    ) -> Result<Vec<Complex64>>;
}

/// Compute noise-optimal channel combination maps from sensitivity maps
///
/// `csm` is `[nLoc, nc]`; `rn = None` means identity noise covariance.
/// Rows are scaled to unity signal gain, `sum_c ccm[c] * csm[c] = 1`;
/// locations with zero sensitivity in every channel stay zero.
pub fn compute_channel_combination_maps(
    csm: &[Complex64],
    n_loc: usize,
    nc: usize,
    rn: Option<&[Complex64]>,
) -> Result<Vec<Complex64>> {
    if csm.len() != n_loc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "csm has {} elements, expected {} x {}",
            csm.len(),
            n_loc,
            nc
        )));
    }
    let rn_inv = match rn {
        None => None,
        Some(rn) => Some(linalg::invert_hpd(rn, nc)?),
    };

    let mut ccm = vec![Complex64::new(0.0, 0.0); n_loc * nc];
    let mut relative = vec![Complex64::new(0.0, 0.0); nc];
    for loc in 0..n_loc {
        match &rn_inv {
            None => {
                for c in 0..nc {
                    relative[c] = csm[loc + c * n_loc].conj();
                }
            }
            Some(inv) => {
                for c in 0..nc {
                    let mut s = Complex64::new(0.0, 0.0);
                    for k in 0..nc {
                        s += csm[loc + k * n_loc].conj() * inv[k + c * nc];
                    }
                    relative[c] = s;
                }
            }
        }
        let mut gain = Complex64::new(0.0, 0.0);
        for c in 0..nc {
            gain += relative[c] * csm[loc + c * n_loc];
        }
        let scale = gain.norm();
        if scale > 0.0 {
            for c in 0..nc {
                ccm[loc + c * n_loc] = relative[c] / scale;
            }
        }
    }
    Ok(ccm)
}

/// Root-sum-of-squares reduction over the channel axis
pub fn compute_root_sum_of_squares(x: &[Complex64], n_loc: usize, nc: usize) -> Result<Vec<f64>> {
    if x.len() != n_loc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "input has {} elements, expected {} x {}",
            x.len(),
            n_loc,
            nc
        )));
    }
    let mut y = vec![0.0; n_loc];
    for c in 0..nc {
        for loc in 0..n_loc {
            y[loc] += x[loc + c * n_loc].norm_sqr();
        }
    }
    for v in y.iter_mut() {
        *v = v.sqrt();
    }
    Ok(y)
}

/// Normalize the shading profile of csm/ccm images to match a
/// root-sum-of-squares combination
///
/// Divides each location's channel vector by its Euclidean norm; zero
/// locations map to zero. Returns the normalized images and the per
/// location correction factors. Applying the normalization twice is a
/// no-op.
pub fn normalize_shading_to_sos(
    im: &[Complex64],
    n_loc: usize,
    nc: usize,
) -> Result<(Vec<Complex64>, Vec<f64>)> {
    let norm = compute_root_sum_of_squares(im, n_loc, nc)?;
    let mut correction = vec![0.0; n_loc];
    for loc in 0..n_loc {
        if norm[loc] > 0.0 {
            correction[loc] = 1.0 / norm[loc];
        }
    }
    let mut out = vec![Complex64::new(0.0, 0.0); im.len()];
    for c in 0..nc {
        for loc in 0..n_loc {
            out[loc + c * n_loc] = im[loc + c * n_loc] * correction[loc];
        }
    }
    Ok((out, correction))
}
