//! Data-driven virtual coil (DVC) channel combination
//!
//! Builds a phase-consistent virtual coil image by computing dominant
//! eigenvector combinations over overlapping blocks, stitching the block
//! phases together from the image center outward, then fitting a global
//! k-space kernel per channel against Fourier encoding images weighted by
//! the conjugate virtual coil. The kernels synthesize channel combination
//! maps the same way sensitivity maps would.

use num_complex::Complex64;
use tracing::debug;

use crate::combine::{self, CcmMethod};
use crate::csm;
use crate::error::{ReconError, Result};
use crate::linalg;
use crate::viz::DiagnosticSink;

/// Parameters for the DVC driver
#[derive(Debug, Clone)]
pub struct DvcOptions {
    /// k-space kernel shape, default 5 x 5
    pub kernel_shape: (usize, usize),
    /// k-space oversampling ratio of the kernel, default (1.25, 1.25)
    pub oversampling: (f64, f64),
    /// Output ccm shape; `None` means the calibration image shape
    pub ccm_shape: Option<(usize, usize)>,
}

impl Default for DvcOptions {
    fn default() -> Self {
        Self {
            kernel_shape: (5, 5),
            oversampling: (1.25, 1.25),
            ccm_shape: None,
        }
    }
}

/// Fourier encoding images for every kernel sample location
///
/// Coefficient `kxi + wx*kyi` gets the plane wave
/// `exp(2πi (kx*x + ky*y))` with `kx = (kxi - wx/2) / (ovx * nx)`.
/// Output is `[nx, ny, wx*wy]` in Fortran order.
pub fn create_fourier_encoding_images(
    im_shape: (usize, usize),
    kernel_shape: (usize, usize),
    oversampling: (f64, f64),
) -> Vec<Complex64> {
    let (nx, ny) = im_shape;
    let (wx, wy) = kernel_shape;
    let n_loc = nx * ny;
    let mut encoding = vec![Complex64::new(0.0, 0.0); n_loc * wx * wy];
    for kyi in 0..wy {
        for kxi in 0..wx {
            let kx = (kxi as f64 - wx as f64 * 0.5) / (oversampling.0 * nx as f64);
            let ky = (kyi as f64 - wy as f64 * 0.5) / (oversampling.1 * ny as f64);
            let base = (kxi + wx * kyi) * n_loc;
            for y in 0..ny {
                for x in 0..nx {
                    let phase = 2.0 * std::f64::consts::PI * (kx * x as f64 + ky * y as f64);
                    encoding[base + x + y * nx] = Complex64::from_polar(1.0, phase);
                }
            }
        }
    }
    encoding
}

/// Overlapping virtual-coil blocks from channel calibration images
///
/// Computes the dominant eigenvector over each analysis window (5 power
/// iterations) and projects the synthesis block of every channel onto its
/// conjugate. Returns `[bsx, bsy, nbx, nby]` blocks in Fortran order plus
/// the block grid dimensions.
pub fn generate_vc_blocks(
    im: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    analysis: (usize, usize),
    synthesis: (usize, usize),
    overlap: (usize, usize),
) -> Result<(Vec<Complex64>, (usize, usize))> {
    let n_loc = nx * ny;
    let lookup = csm::compute_full_correlation_lookup(im, n_loc, nc)?;
    let (matrices, (nbx, nby)) =
        csm::compute_matrix_set(&lookup, nx, ny, nc, analysis, synthesis, overlap)?;
    let eigvecs = csm::compute_dominant_eigenvectors(&matrices, nbx * nby, nc, 5)?;

    let step = (synthesis.0 - overlap.0, synthesis.1 - overlap.1);
    let (bsx, bsy) = synthesis;
    let n_blocks = nbx * nby;
    let mut blocks = vec![Complex64::new(0.0, 0.0); bsx * bsy * n_blocks];
    for by in 0..nby {
        for bx in 0..nbx {
            let block_idx = bx + by * nbx;
            let (x0, y0) = (bx * step.0, by * step.1);
            for yy in 0..bsy {
                for xx in 0..bsx {
                    let mut s = Complex64::new(0.0, 0.0);
                    for c in 0..nc {
                        s += eigvecs[block_idx + c * n_blocks].conj()
                            * im[(x0 + xx) + (y0 + yy) * nx + c * n_loc];
                    }
                    blocks[xx + yy * bsx + block_idx * bsx * bsy] = s;
                }
            }
        }
    }
    Ok((blocks, (nbx, nby)))
}

/// Fit and return the removal phasor for an affine (planar) phase
///
/// The phase at the maximum-magnitude sample anchors the fit; the
/// residual angles are fitted to `c0*x + c1*y + c2` by magnitude-weighted
/// least squares. An all-zero block yields an all-ones phasor. No phase
/// unwrapping is attempted; blocks with wrapped phase break the fit.
pub fn fit_to_affine_phase(block: &[Complex64], bx: usize, by: usize) -> Result<Vec<Complex64>> {
    if block.len() != bx * by {
        return Err(ReconError::ShapeMismatch(format!(
            "block has {} elements, expected {} x {}",
            block.len(),
            bx,
            by
        )));
    }
    let anchor = match block
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
    {
        Some((idx, v)) if v.norm() > 0.0 => block[idx].arg(),
        _ => return Ok(vec![Complex64::new(1.0, 0.0); bx * by]),
    };
    let anchor_phasor = Complex64::from_polar(1.0, -anchor);

    // Weighted normal equations for [x, y, 1] against the residual angle
    let mut ata = [0.0f64; 9];
    let mut atb = [0.0f64; 3];
    for y in 0..by {
        for x in 0..bx {
            let v = block[x + y * bx] * anchor_phasor;
            let w = v.norm();
            if w == 0.0 {
                continue;
            }
            let w2 = w * w;
            let (xf, yf) = (x as f64, y as f64);
            let basis = [xf, yf, 1.0];
            for j in 0..3 {
                for i in 0..3 {
                    ata[i + j * 3] += w2 * basis[i] * basis[j];
                }
                atb[j] += w2 * basis[j] * v.arg();
            }
        }
    }
    let coeff = match linalg::solve3_real(&ata, &atb) {
        Some(coeff) => coeff,
        // Degenerate weighting (e.g. a single nonzero sample); remove
        // only the anchor phase
        None => [0.0, 0.0, 0.0],
    };

    let mut correction = vec![Complex64::new(0.0, 0.0); bx * by];
    for y in 0..by {
        for x in 0..bx {
            let phase = x as f64 * coeff[0] + y as f64 * coeff[1] + coeff[2] + anchor;
            correction[x + y * bx] = Complex64::from_polar(1.0, -phase);
        }
    }
    Ok(correction)
}

/// Fit and return the removal phasor for a constant phase
///
/// The anchor is the angle of the maximum-magnitude sample; the residual
/// is the magnitude-weighted mean angle. An all-zero block yields an
/// all-ones phasor.
pub fn fit_to_constant_phase(block: &[Complex64], bx: usize, by: usize) -> Result<Vec<Complex64>> {
    if block.len() != bx * by {
        return Err(ReconError::ShapeMismatch(format!(
            "block has {} elements, expected {} x {}",
            block.len(),
            bx,
            by
        )));
    }
    let anchor = match block
        .iter()
        .max_by(|a, b| a.norm().total_cmp(&b.norm()))
    {
        Some(v) if v.norm() > 0.0 => v.arg(),
        _ => return Ok(vec![Complex64::new(1.0, 0.0); bx * by]),
    };
    let anchor_phasor = Complex64::from_polar(1.0, -anchor);
    let mut weighted_phase = 0.0;
    let mut total_weight = 0.0;
    for v in block {
        let r = v * anchor_phasor;
        weighted_phase += r.arg() * r.norm();
        total_weight += r.norm();
    }
    let ave = weighted_phase / total_weight;
    Ok(vec![
        Complex64::from_polar(1.0, -(anchor + ave));
        bx * by
    ])
}

/// Stitch overlapping virtual-coil blocks into one consistent phase image
///
/// Blocks are placed from the center block outward (along y first, then
/// x) so the phase reference grows from the high-SNR image center. The
/// first block has its own affine phase removed; every later block is
/// corrected by the affine fit of its phase difference against the
/// already stitched overlap, resolving the per-block sign ambiguity of
/// the eigenvectors. Returns the stitched phase, shape
/// `nBlocks*blockSize - (nBlocks-1)*overlap` per axis.
pub fn stitch_vc_blocks(
    blocks: &[Complex64],
    block_size: (usize, usize),
    n_blocks: (usize, usize),
    overlap: (usize, usize),
) -> Result<(Vec<f64>, (usize, usize))> {
    let (bsx, bsy) = block_size;
    let (nbx, nby) = n_blocks;
    if blocks.len() != bsx * bsy * nbx * nby {
        return Err(ReconError::ShapeMismatch(format!(
            "block set has {} elements, expected {}x{}x{}x{}",
            blocks.len(),
            bsx,
            bsy,
            nbx,
            nby
        )));
    }
    if overlap.0 >= bsx || overlap.1 >= bsy {
        return Err(ReconError::InvalidArgument(
            "overlap must be smaller than the block".into(),
        ));
    }
    let step = (bsx - overlap.0, bsy - overlap.1);
    let nx = nbx * bsx - (nbx - 1) * overlap.0;
    let ny = nby * bsy - (nby - 1) * overlap.1;

    let mut im = vec![Complex64::new(0.0, 0.0); nx * ny];
    let mut first = true;
    for &iby in center_out_order(nby).iter() {
        for &ibx in center_out_order(nbx).iter() {
            let (x0, y0) = (ibx * step.0, iby * step.1);
            let block = &blocks[(ibx + iby * nbx) * bsx * bsy..(ibx + iby * nbx + 1) * bsx * bsy];

            let correction = if first {
                first = false;
                fit_to_affine_phase(block, bsx, bsy)?
            } else {
                let mut diff = vec![Complex64::new(0.0, 0.0); bsx * bsy];
                for yy in 0..bsy {
                    for xx in 0..bsx {
                        diff[xx + yy * bsx] =
                            block[xx + yy * bsx] * im[(x0 + xx) + (y0 + yy) * nx].conj();
                    }
                }
                fit_to_affine_phase(&diff, bsx, bsy)?
            };
            for yy in 0..bsy {
                for xx in 0..bsx {
                    im[(x0 + xx) + (y0 + yy) * nx] =
                        correction[xx + yy * bsx] * block[xx + yy * bsx];
                }
            }
        }
    }
    Ok((im.iter().map(|v| v.arg()).collect(), (nx, ny)))
}

// Block visit order: center index down to 0, then center+1 upward
fn center_out_order(n: usize) -> Vec<usize> {
    let half = n >> 1;
    let mut order: Vec<usize> = (0..=half).rev().collect();
    order.extend((half + 1)..n);
    order
}

/// Fit per-channel DVC k-space kernels against the virtual coil image
///
/// Least-squares regression of the conjugate channel images onto Fourier
/// encoding images weighted by the conjugate virtual coil. Returns
/// `[wx, wy, nc]` kernels.
pub fn compute_dvc_kernels(
    channel_im: &[Complex64],
    vc_im: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    kernel_shape: (usize, usize),
    oversampling: (f64, f64),
) -> Result<Vec<Complex64>> {
    let n_loc = nx * ny;
    if channel_im.len() != n_loc * nc || vc_im.len() != n_loc {
        return Err(ReconError::ShapeMismatch(format!(
            "channel images {} / vc image {} inconsistent with {} x {} x {}",
            channel_im.len(),
            vc_im.len(),
            nx,
            ny,
            nc
        )));
    }
    let encoding = create_fourier_encoding_images((nx, ny), kernel_shape, oversampling);
    let num_coeff = kernel_shape.0 * kernel_shape.1;

    // Basis column j = encoding image j weighted by conj(vc)
    let mut gram = vec![Complex64::new(0.0, 0.0); num_coeff * num_coeff];
    let mut rhs = vec![Complex64::new(0.0, 0.0); num_coeff * nc];
    for j in 0..num_coeff {
        for i in 0..num_coeff {
            let mut s = Complex64::new(0.0, 0.0);
            for loc in 0..n_loc {
                let bi = encoding[loc + i * n_loc] * vc_im[loc].conj();
                let bj = encoding[loc + j * n_loc] * vc_im[loc].conj();
                s += bi.conj() * bj;
            }
            gram[i + j * num_coeff] = s;
        }
    }
    for c in 0..nc {
        for i in 0..num_coeff {
            let mut s = Complex64::new(0.0, 0.0);
            for loc in 0..n_loc {
                let bi = encoding[loc + i * n_loc] * vc_im[loc].conj();
                s += bi.conj() * channel_im[loc + c * n_loc].conj();
            }
            rhs[i + c * num_coeff] = s;
        }
    }
    linalg::solve(&gram, &rhs, num_coeff, nc)
}

/// Synthesize channel combination maps from DVC kernels
///
/// Evaluates the kernels against encoding images of the requested shape
/// and normalizes the shading to root sum of squares.
pub fn compute_ccm_from_kernels(
    kernels: &[Complex64],
    kernel_shape: (usize, usize),
    nc: usize,
    oversampling: (f64, f64),
    im_shape: (usize, usize),
) -> Result<Vec<Complex64>> {
    let num_coeff = kernel_shape.0 * kernel_shape.1;
    if kernels.len() != num_coeff * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "kernels have {} elements, expected {} x {}",
            kernels.len(),
            num_coeff,
            nc
        )));
    }
    let (nx, ny) = im_shape;
    let n_loc = nx * ny;
    let encoding = create_fourier_encoding_images(im_shape, kernel_shape, oversampling);

    let mut ccm = vec![Complex64::new(0.0, 0.0); n_loc * nc];
    for c in 0..nc {
        for j in 0..num_coeff {
            let k = kernels[j + c * num_coeff];
            for loc in 0..n_loc {
                ccm[loc + c * n_loc] += encoding[loc + j * n_loc] * k;
            }
        }
    }
    let (ccm, _) = combine::normalize_shading_to_sos(&ccm, n_loc, nc)?;
    Ok(ccm)
}

/// End-to-end DVC channel combination maps from calibration images
///
/// Analysis and synthesis blocks default to a quarter of the image with
/// an eighth overlap. The intermediate virtual coil image is offered to
/// the diagnostic sink.
pub fn compute_ccm_dvc(
    im: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    opts: &DvcOptions,
    sink: Option<&dyn DiagnosticSink>,
) -> Result<Vec<Complex64>> {
    let n_loc = nx * ny;
    if im.len() != n_loc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "calibration images have {} elements, expected {} x {} x {}",
            im.len(),
            nx,
            ny,
            nc
        )));
    }
    let block = (nx >> 2, ny >> 2);
    let overlap = (nx >> 3, ny >> 3);
    if block.0 <= overlap.0 || block.1 <= overlap.1 {
        return Err(ReconError::InvalidArgument(format!(
            "calibration extent {} x {} too small for block partitioning",
            nx, ny
        )));
    }

    debug!(nx, ny, nc, "generating virtual-coil blocks");
    let (blocks, n_blocks) = generate_vc_blocks(im, nx, ny, nc, block, block, overlap)?;
    let (phase, (px, py)) = stitch_vc_blocks(&blocks, block, n_blocks, overlap)?;
    if (px, py) != (nx, ny) {
        return Err(ReconError::ShapeMismatch(format!(
            "stitched phase is {} x {} but calibration is {} x {}",
            px, py, nx, ny
        )));
    }

    let vc_mag = combine::compute_root_sum_of_squares(im, n_loc, nc)?;
    let vc_im: Vec<Complex64> = phase
        .iter()
        .zip(vc_mag.iter())
        .map(|(&p, &m)| Complex64::from_polar(m, p))
        .collect();
    if let Some(sink) = sink {
        sink.show("vcIm", &vc_im, nx, ny);
    }

    debug!(kernel = ?opts.kernel_shape, "fitting DVC kernels");
    let kernels = compute_dvc_kernels(im, &vc_im, nx, ny, nc, opts.kernel_shape, opts.oversampling)?;
    let ccm_shape = opts.ccm_shape.unwrap_or((nx, ny));
    compute_ccm_from_kernels(&kernels, opts.kernel_shape, nc, opts.oversampling, ccm_shape)
}

/// DVC channel combination as a [`CcmMethod`] strategy
#[derive(Debug, Clone, Default)]
pub struct DvcCcm {
    pub opts: DvcOptions,
}

impl CcmMethod for DvcCcm {
    fn compute_ccm(
        &self,
        im: &[Complex64],
        nx: usize,
        ny: usize,
        nc: usize,
    ) -> Result<Vec<Complex64>> {
        compute_ccm_dvc(im, nx, ny, nc, &self.opts, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn test_encoding_images_are_plane_waves() {
        let enc = create_fourier_encoding_images((4, 4), (2, 2), (1.0, 1.0));
        assert_eq!(enc.len(), 4 * 4 * 4);
        // Coefficient (0, 0): kx = ky = -1/4, value at (1, 1) is
        // exp(-2*pi*i/2) = -1
        let v = enc[1 + 1 * 4];
        assert!((v - c(-1.0, 0.0)).norm() < 1e-12);
        // All samples have unit magnitude
        assert!(enc.iter().all(|e| (e.norm() - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_affine_fit_removes_planar_phase() {
        let (bx, by) = (6, 5);
        let (c0, c1, c2) = (0.05, -0.08, 0.4);
        let block: Vec<Complex64> = (0..bx * by)
            .map(|i| {
                let (x, y) = (i % bx, i / bx);
                let mag = 1.0 + (x + y) as f64 * 0.1;
                Complex64::from_polar(mag, c0 * x as f64 + c1 * y as f64 + c2)
            })
            .collect();
        let correction = fit_to_affine_phase(&block, bx, by).unwrap();
        for (b, corr) in block.iter().zip(correction.iter()) {
            let flattened = b * corr;
            assert!(
                flattened.arg().abs() < 1e-9,
                "residual phase {}",
                flattened.arg()
            );
        }
    }

    #[test]
    fn test_affine_fit_zero_block_is_identity() {
        let block = vec![c(0.0, 0.0); 12];
        let correction = fit_to_affine_phase(&block, 4, 3).unwrap();
        assert!(correction.iter().all(|v| (v - c(1.0, 0.0)).norm() < 1e-12));
    }

    #[test]
    fn test_constant_fit_removes_uniform_phase() {
        let block: Vec<Complex64> = (0..12)
            .map(|i| Complex64::from_polar(1.0 + i as f64 * 0.05, 0.7))
            .collect();
        let correction = fit_to_constant_phase(&block, 4, 3).unwrap();
        for (b, corr) in block.iter().zip(correction.iter()) {
            assert!((b * corr).arg().abs() < 1e-10);
        }
    }

    #[test]
    fn test_stitch_recovers_smooth_phase() {
        // Build blocks from a single smooth affine-phase image; stitching
        // must reproduce that phase up to a global affine ramp, so the
        // stitched result of a constant-phase image is constant zero.
        let (nx, ny) = (16, 16);
        let block = (4, 4);
        let overlap = (2, 2);
        let step = (block.0 - overlap.0, block.1 - overlap.1);
        let nbx = (nx - block.0) / step.0 + 1;
        let nby = (ny - block.1) / step.1 + 1;

        let im: Vec<Complex64> = (0..nx * ny)
            .map(|i| Complex64::from_polar(1.0 + (i % 5) as f64 * 0.2, 0.3))
            .collect();
        let mut blocks = vec![c(0.0, 0.0); block.0 * block.1 * nbx * nby];
        for by in 0..nby {
            for bx in 0..nbx {
                // Alternate the eigenvector sign ambiguity between blocks
                let sign = if (bx + by) % 2 == 0 { 1.0 } else { -1.0 };
                for yy in 0..block.1 {
                    for xx in 0..block.0 {
                        blocks[xx + yy * block.0 + (bx + by * nbx) * block.0 * block.1] =
                            im[(bx * step.0 + xx) + (by * step.1 + yy) * nx] * sign;
                    }
                }
            }
        }
        let (phase, (px, py)) = stitch_vc_blocks(&blocks, block, (nbx, nby), overlap).unwrap();
        assert_eq!((px, py), (nx, ny));
        for p in phase {
            assert!(p.abs() < 1e-8, "stitched phase residual {}", p);
        }
    }

    #[test]
    fn test_dvc_kernels_reproduce_encoded_channel() {
        // Channel images synthesized exactly from the encoding basis and
        // a unit virtual coil are reproduced by the kernel fit.
        let (nx, ny, nc) = (8, 8, 1);
        let kernel_shape = (3, 3);
        let oversampling = (1.25, 1.25);
        let encoding = create_fourier_encoding_images((nx, ny), kernel_shape, oversampling);
        let n_loc = nx * ny;
        let num_coeff = kernel_shape.0 * kernel_shape.1;

        let mut true_kernel = vec![c(0.0, 0.0); num_coeff];
        true_kernel[4] = c(1.0, 0.0);
        true_kernel[1] = c(0.2, -0.3);

        // channel = conj(sum_j encoding_j * k_j) given vc = 1
        let mut channel = vec![c(0.0, 0.0); n_loc];
        for j in 0..num_coeff {
            for loc in 0..n_loc {
                channel[loc] += (encoding[loc + j * n_loc] * true_kernel[j]).conj();
            }
        }
        let vc = vec![c(1.0, 0.0); n_loc];
        let kernels =
            compute_dvc_kernels(&channel, &vc, nx, ny, nc, kernel_shape, oversampling).unwrap();
        for j in 0..num_coeff {
            assert!(
                (kernels[j] - true_kernel[j]).norm() < 1e-9,
                "coefficient {}: {} vs {}",
                j,
                kernels[j],
                true_kernel[j]
            );
        }
    }

    #[test]
    fn test_ccm_from_kernels_is_sos_normalized() {
        let kernel_shape = (3, 3);
        let nc = 2;
        let mut kernels = vec![c(0.0, 0.0); 9 * nc];
        kernels[4] = c(1.0, 0.0);
        kernels[9 + 4] = c(0.0, 1.0);
        let ccm =
            compute_ccm_from_kernels(&kernels, kernel_shape, nc, (1.25, 1.25), (8, 8)).unwrap();
        let n_loc = 64;
        for loc in 0..n_loc {
            let norm: f64 = (0..nc).map(|ch| ccm[loc + ch * n_loc].norm_sqr()).sum();
            assert!((norm.sqrt() - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_compute_ccm_dvc_end_to_end() {
        // Smooth single-phase object with two channels differing by a
        // constant phasor; the DVC ccm must combine them coherently:
        // sum(ccm * im) has (nearly) uniform phase.
        let (nx, ny, nc) = (32, 32, 2);
        let n_loc = nx * ny;
        let mut im = vec![c(0.0, 0.0); n_loc * nc];
        for y in 0..ny {
            for x in 0..nx {
                let cx = x as f64 - nx as f64 / 2.0;
                let cy = y as f64 - ny as f64 / 2.0;
                let mag = (-(cx * cx + cy * cy) / 300.0).exp() + 0.05;
                im[x + y * nx] = Complex64::from_polar(mag, 0.2);
                im[x + y * nx + n_loc] = Complex64::from_polar(mag * 0.8, -0.4);
            }
        }
        let ccm = compute_ccm_dvc(&im, nx, ny, nc, &DvcOptions::default(), None).unwrap();
        assert_eq!(ccm.len(), n_loc * nc);

        // Both channels are fitted against the same spatial profile, so
        // the inter-channel ccm phase equals the true channel phase
        // difference everywhere: arg(conj(s0) * s1) = -0.4 - 0.2 = -0.6.
        for loc in 0..n_loc {
            let rel = ccm[loc] * ccm[loc + n_loc].conj();
            assert!(
                (rel.arg() + 0.6).abs() < 1e-6,
                "inter-channel phase {} at {}",
                rel.arg(),
                loc
            );
            let norm: f64 = (0..nc).map(|ch| ccm[loc + ch * n_loc].norm_sqr()).sum();
            assert!((norm.sqrt() - 1.0).abs() < 1e-9, "SoS norm at {}", loc);
        }
    }
}
