//! Coil sensitivity estimation: McKenzie relative maps and the Walsh
//! eigenvector method
//!
//! The Walsh path builds per-voxel channel correlation matrices, sums them
//! over analysis blocks and extracts the dominant eigenvector per block
//! with a short power iteration.

use num_complex::Complex64;

use crate::combine::{self, CcmMethod};
use crate::error::{ReconError, Result};

/// Relative coil sensitivity maps per McKenzie et al.
/// (Magn Reson Med 2002;47:529-538)
///
/// Each location's channel vector is divided by its root-sum-of-squares
/// magnitude; zero locations stay zero.
pub fn estimate_csm_mckenzie(im: &[Complex64], n_loc: usize, nc: usize) -> Result<Vec<Complex64>> {
    let (csm, _) = combine::normalize_shading_to_sos(im, n_loc, nc)?;
    Ok(csm)
}

/// Per-voxel channel correlation lookup
///
/// Input images are SoS-shading-normalized first, then
/// `lookup[loc, c1, c2] = v[c1] * conj(v[c2])` so each voxel carries a
/// Hermitian rank-one matrix. Output shape is `[nLoc, nc, nc]` in Fortran
/// order.
pub fn compute_full_correlation_lookup(
    im: &[Complex64],
    n_loc: usize,
    nc: usize,
) -> Result<Vec<Complex64>> {
    let (voxels, _) = combine::normalize_shading_to_sos(im, n_loc, nc)?;
    let mut lookup = vec![Complex64::new(0.0, 0.0); n_loc * nc * nc];
    for c1 in 0..nc {
        for loc in 0..n_loc {
            lookup[loc + n_loc * (c1 + nc * c1)] =
                Complex64::new(voxels[loc + c1 * n_loc].norm_sqr(), 0.0);
        }
        for c2 in 0..c1 {
            for loc in 0..n_loc {
                let corr = voxels[loc + c1 * n_loc] * voxels[loc + c2 * n_loc].conj();
                lookup[loc + n_loc * (c1 + nc * c2)] = corr;
                lookup[loc + n_loc * (c2 + nc * c1)] = corr.conj();
            }
        }
    }
    Ok(lookup)
}

/// Sum the correlation lookup over analysis blocks laid out on a synthesis
/// grid
///
/// The synthesis grid steps by `synthesis - overlap`; each analysis block
/// is centered on its synthesis block by `border = (analysis - synthesis)/2`
/// and clamped to the image, no wraparound. Returns one `nc x nc`
/// column-major matrix per block (blocks contiguous) and the block grid
/// dimensions.
pub fn compute_matrix_set(
    lookup: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    analysis: (usize, usize),
    synthesis: (usize, usize),
    overlap: (usize, usize),
) -> Result<(Vec<Complex64>, (usize, usize))> {
    let n_loc = nx * ny;
    if lookup.len() != n_loc * nc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "lookup has {} elements, expected {} x {} x {}",
            lookup.len(),
            n_loc,
            nc,
            nc
        )));
    }
    if synthesis.0 <= overlap.0 || synthesis.1 <= overlap.1 {
        return Err(ReconError::InvalidArgument(
            "synthesis block must be larger than its overlap".into(),
        ));
    }
    if analysis.0 < synthesis.0 || analysis.1 < synthesis.1 {
        return Err(ReconError::InvalidArgument(
            "analysis block must contain the synthesis block".into(),
        ));
    }
    let step = (synthesis.0 - overlap.0, synthesis.1 - overlap.1);
    let nbx = (nx - synthesis.0) / step.0 + 1;
    let nby = (ny - synthesis.1) / step.1 + 1;
    let border = ((analysis.0 - synthesis.0) >> 1, (analysis.1 - synthesis.1) >> 1);

    let mut matrices = vec![Complex64::new(0.0, 0.0); nbx * nby * nc * nc];
    for by in 0..nby {
        for bx in 0..nbx {
            let x0 = (bx * step.0).saturating_sub(border.0);
            let y0 = (by * step.1).saturating_sub(border.1);
            let x1 = (x0 + analysis.0).min(nx);
            let y1 = (y0 + analysis.1).min(ny);
            let mat = &mut matrices[(bx + by * nbx) * nc * nc..(bx + by * nbx + 1) * nc * nc];
            for j in 0..nc {
                for i in 0..nc {
                    let mut s = Complex64::new(0.0, 0.0);
                    for y in y0..y1 {
                        for x in x0..x1 {
                            s += lookup[x + y * nx + n_loc * (i + nc * j)];
                        }
                    }
                    mat[i + j * nc] = s;
                }
            }
        }
    }
    Ok((matrices, (nbx, nby)))
}

/// Dominant eigenvector of each matrix in a set, by the power method
///
/// `matrices` holds `n_matrices` contiguous `m x m` column-major matrices.
/// The iteration starts from an all-ones vector and rescales by the
/// largest magnitude each step; all-zero matrices yield all-zero vectors.
/// The result is SoS-shading-normalized with the first channel's phase
/// anchored to zero, and is laid out `[nMatrices, m]` in Fortran order so
/// it drops straight into image-stack shape.
///
/// Two iterations are enough for the near-rank-one matrices produced by
/// [`compute_matrix_set`]; callers wanting a tighter eigenvector pass more.
pub fn compute_dominant_eigenvectors(
    matrices: &[Complex64],
    n_matrices: usize,
    m: usize,
    num_iterations: usize,
) -> Result<Vec<Complex64>> {
    if matrices.len() != n_matrices * m * m {
        return Err(ReconError::ShapeMismatch(format!(
            "matrix set has {} elements, expected {} x {} x {}",
            matrices.len(),
            n_matrices,
            m,
            m
        )));
    }

    let mut out = vec![Complex64::new(0.0, 0.0); n_matrices * m];
    let mut v = vec![Complex64::new(0.0, 0.0); m];
    let mut next = vec![Complex64::new(0.0, 0.0); m];
    for mat_idx in 0..n_matrices {
        let a = &matrices[mat_idx * m * m..(mat_idx + 1) * m * m];
        if a.iter().all(|e| e.norm() == 0.0) {
            continue;
        }

        v.fill(Complex64::new(1.0, 0.0));
        for _ in 0..num_iterations {
            for j in 0..m {
                let mut s = Complex64::new(0.0, 0.0);
                for i in 0..m {
                    s += a[i + j * m].conj() * v[i];
                }
                next[j] = s;
            }
            let scale = next.iter().map(|e| e.norm()).fold(0.0, f64::max);
            if scale == 0.0 {
                break;
            }
            for (dst, src) in v.iter_mut().zip(next.iter()) {
                *dst = src / scale;
            }
        }

        let norm: f64 = v.iter().map(|e| e.norm_sqr()).sum::<f64>().sqrt();
        if norm == 0.0 {
            continue;
        }
        // Eigenvector phase is arbitrary; anchor channel 0 real-positive
        let phase = Complex64::from_polar(1.0, -v[0].arg());
        for (j, e) in v.iter().enumerate() {
            out[mat_idx + j * n_matrices] = e * phase / norm;
        }
    }
    Ok(out)
}

/// Coil sensitivity maps by the eigenvector method of Walsh et al.
/// (Magn Reson Med 2000;43:682-90)
///
/// `smoothing` is the analysis block edge, default 5.
pub fn estimate_csm_walsh(
    im: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    smoothing: Option<usize>,
) -> Result<Vec<Complex64>> {
    let smoothing = smoothing.unwrap_or(5);
    if smoothing == 0 {
        return Err(ReconError::InvalidArgument(
            "smoothing block must be nonzero".into(),
        ));
    }
    let lookup = compute_full_correlation_lookup(im, nx * ny, nc)?;
    let (matrices, (nbx, nby)) =
        compute_matrix_set(&lookup, nx, ny, nc, (smoothing, smoothing), (1, 1), (0, 0))?;
    debug_assert_eq!((nbx, nby), (nx, ny));
    compute_dominant_eigenvectors(&matrices, nbx * nby, nc, 5)
}

/// McKenzie sensitivity estimate followed by noise-optimal combination maps
#[derive(Debug, Clone, Default)]
pub struct McKenzieCcm {
    /// Optional channel noise covariance; `None` means identity
    pub rn: Option<Vec<Complex64>>,
}

impl CcmMethod for McKenzieCcm {
    fn compute_ccm(
        &self,
        im: &[Complex64],
        nx: usize,
        ny: usize,
        nc: usize,
    ) -> Result<Vec<Complex64>> {
        let csm = estimate_csm_mckenzie(im, nx * ny, nc)?;
        combine::compute_channel_combination_maps(&csm, nx * ny, nc, self.rn.as_deref())
    }
}

/// Walsh sensitivity estimate followed by noise-optimal combination maps
#[derive(Debug, Clone)]
pub struct WalshCcm {
    /// Analysis block edge for the eigenvector smoothing
    pub smoothing: usize,
    /// Optional channel noise covariance; `None` means identity
    pub rn: Option<Vec<Complex64>>,
}

impl Default for WalshCcm {
    fn default() -> Self {
        Self {
            smoothing: 5,
            rn: None,
        }
    }
}

impl CcmMethod for WalshCcm {
    fn compute_ccm(
        &self,
        im: &[Complex64],
        nx: usize,
        ny: usize,
        nc: usize,
    ) -> Result<Vec<Complex64>> {
        let csm = estimate_csm_walsh(im, nx, ny, nc, Some(self.smoothing))?;
        combine::compute_channel_combination_maps(&csm, nx * ny, nc, self.rn.as_deref())
    }
}
