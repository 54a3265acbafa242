//! Common test utilities for pmri-core integration tests
//!
//! Synthetic phantom and coil data plus masked error metrics. All arrays
//! are Fortran (column-major) ordered with the channel axis last,
//! matching the library convention.

use num_complex::Complex64;
use std::f64::consts::PI;

/// Smooth phantom built from a few Gaussian blobs
///
/// Strictly positive everywhere so that coil images never vanish, with
/// enough spectral content that calibration fits are well conditioned.
pub fn gaussian_phantom(nx: usize, ny: usize) -> Vec<f64> {
    let blobs: [(f64, f64, f64, f64); 3] = [
        (0.50, 0.50, 0.22, 1.0),
        (0.35, 0.62, 0.10, 0.6),
        (0.64, 0.38, 0.12, 0.8),
    ];
    let n = nx.min(ny) as f64;
    let mut rho = vec![0.0; nx * ny];
    for y in 0..ny {
        for x in 0..nx {
            let mut v = 0.0;
            for &(bx, by, sigma, amp) in blobs.iter() {
                let dx = x as f64 - bx * nx as f64;
                let dy = y as f64 - by * ny as f64;
                let s = sigma * n;
                v += amp * (-(dx * dx + dy * dy) / (2.0 * s * s)).exp();
            }
            rho[x + y * nx] = v;
        }
    }
    rho
}

/// Synthetic coil sensitivity maps: `nc` coils on a ring around the image
///
/// Each coil has a wide Gaussian falloff from its center and a gentle
/// linear phase pointing away from it. Nonzero at every pixel, so channel
/// vectors stay full rank across aliased locations.
pub fn synthetic_csm(nx: usize, ny: usize, nc: usize) -> Vec<Complex64> {
    let n = nx.min(ny) as f64;
    let (cx, cy) = (nx as f64 / 2.0, ny as f64 / 2.0);
    let ring = 0.6 * n;
    let width = 0.75 * n;

    let mut csm = vec![Complex64::new(0.0, 0.0); nx * ny * nc];
    for c in 0..nc {
        let theta = 2.0 * PI * c as f64 / nc as f64;
        let (px, py) = (cx + ring * theta.cos(), cy + ring * theta.sin());
        for y in 0..ny {
            for x in 0..nx {
                let dx = x as f64 - px;
                let dy = y as f64 - py;
                let mag = (-(dx * dx + dy * dy) / (2.0 * width * width)).exp();
                let phase = 0.3 * c as f64
                    + 2.0 * PI * 0.6 * ((x as f64 - cx) * theta.cos() + (y as f64 - cy) * theta.sin())
                        / n;
                csm[x + y * nx + c * nx * ny] = Complex64::from_polar(mag, phase);
            }
        }
    }
    csm
}

/// Multiply a real source image by coil sensitivities, `[nx, ny, nc]`
pub fn channel_images(rho: &[f64], csm: &[Complex64], n_loc: usize, nc: usize) -> Vec<Complex64> {
    let mut im = vec![Complex64::new(0.0, 0.0); n_loc * nc];
    for c in 0..nc {
        for loc in 0..n_loc {
            im[loc + c * n_loc] = csm[loc + c * n_loc] * rho[loc];
        }
    }
    im
}

/// Element-wise magnitude
pub fn magnitude(x: &[Complex64]) -> Vec<f64> {
    x.iter().map(|v| v.norm()).collect()
}

/// Mask of locations whose signal exceeds `frac` of the maximum
pub fn signal_mask(rho: &[f64], frac: f64) -> Vec<u8> {
    let max = rho.iter().cloned().fold(0.0, f64::max);
    rho.iter().map(|&v| (v > frac * max) as u8).collect()
}

/// Compute RMSE between two arrays, only within mask (non-zero values)
pub fn rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 0..a.len() {
        if mask[i] > 0 {
            let diff = a[i] - b[i];
            sum_sq += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Compute NRMSE (normalized by range of ground truth within mask)
pub fn nrmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let rmse_val = rmse(a, b, mask);

    let mut min_b = f64::INFINITY;
    let mut max_b = f64::NEG_INFINITY;
    for i in 0..b.len() {
        if mask[i] > 0 {
            if b[i] < min_b {
                min_b = b[i];
            }
            if b[i] > max_b {
                max_b = b[i];
            }
        }
    }

    let range = max_b - min_b;
    if range == 0.0 {
        return 0.0;
    }
    rmse_val / range
}
