//! Unmixing solvers: per-pixel SENSE and JER-based k-space kernel fitting
//!
//! Both produce unmixing images: per-voxel weights that collapse aliased
//! channel images into an unaliased composite. The JER path is shared by
//! PARS and GRAPPA-style reconstructions; which one it implements is
//! decided entirely by the channel combination maps and the JER table the
//! caller supplies.

use num_complex::Complex64;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::fft;
use crate::jer::JerLookup;
use crate::linalg;

/// SENSE unmixing coefficients for a uniformly undersampled 2-D image
///
/// For every group of `acc` locations aliasing onto the same reduced-FOV
/// pixel, solves the regularized normal equations
/// `(Aᴴ Rn⁻¹ A + λI) x = Aᴴ Rn⁻¹` where `A` collects the csm rows of the
/// aliased locations. λ scales with the local signal energy,
/// `reg * trace(AᴴRn⁻¹A) / numAliasesWithSignal`, and is applied only on
/// diagonal entries carrying signal; groups with no signal anywhere are
/// left zero. Rows along x are independent and solved in parallel.
pub fn compute_sense_unmixing(
    acc: usize,
    csm: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    rn: Option<&[Complex64]>,
    reg: f64,
) -> Result<Vec<Complex64>> {
    let n_loc = nx * ny;
    if csm.len() != n_loc * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "csm has {} elements, expected {} x {} x {}",
            csm.len(),
            nx,
            ny,
            nc
        )));
    }
    if acc == 0 || ny % acc != 0 {
        return Err(ReconError::InvalidArgument(format!(
            "{} phase-encode lines not divisible by acceleration {}",
            ny, acc
        )));
    }
    let rn_inv = match rn {
        None => None,
        Some(rn) => Some(linalg::invert_hpd(rn, nc)?),
    };
    let num_blocks = ny / acc;

    debug!(acc, nx, ny, nc, "solving SENSE unmixing rows");
    let rows: Vec<Vec<Complex64>> = (0..nx)
        .into_par_iter()
        .map(|x| {
            let mut row = vec![Complex64::new(0.0, 0.0); ny * nc];
            let mut a = vec![Complex64::new(0.0, 0.0); nc * acc];
            for block in 0..num_blocks {
                // A column k = channel vector at aliased location k
                let mut any_signal = false;
                for k in 0..acc {
                    let y = block + k * num_blocks;
                    for c in 0..nc {
                        let v = csm[x + y * nx + c * n_loc];
                        if v.norm() > 0.0 {
                            any_signal = true;
                        }
                        a[c + k * nc] = v;
                    }
                }
                if !any_signal {
                    continue;
                }

                // Aᴴ Rn⁻¹, acc x nc
                let mut ah_rn = vec![Complex64::new(0.0, 0.0); acc * nc];
                for j in 0..nc {
                    for k in 0..acc {
                        let mut s = Complex64::new(0.0, 0.0);
                        match &rn_inv {
                            None => s = a[j + k * nc].conj(),
                            Some(inv) => {
                                for c in 0..nc {
                                    s += a[c + k * nc].conj() * inv[c + j * nc];
                                }
                            }
                        }
                        ah_rn[k + j * acc] = s;
                    }
                }
                // Aᴴ Rn⁻¹ A, acc x acc
                let mut aha = vec![Complex64::new(0.0, 0.0); acc * acc];
                for k2 in 0..acc {
                    for k1 in 0..acc {
                        let mut s = Complex64::new(0.0, 0.0);
                        for c in 0..nc {
                            s += ah_rn[k1 + c * acc] * a[c + k2 * nc];
                        }
                        aha[k1 + k2 * acc] = s;
                    }
                }

                let num_alias = (0..acc).filter(|&k| aha[k + k * acc].norm() > 0.0).count();
                if num_alias > 0 && reg > 0.0 {
                    let lambda = reg * linalg::trace(&aha, acc).re / num_alias as f64;
                    for k in 0..acc {
                        if aha[k + k * acc].norm() > 0.0 {
                            aha[k + k * acc] += lambda;
                        }
                    }
                }
                let weights = linalg::solve_hermitian_guarded(&aha, &ah_rn, acc, nc);
                for c in 0..nc {
                    for k in 0..acc {
                        row[(block + k * num_blocks) + c * ny] = weights[k + c * acc];
                    }
                }
            }
            row
        })
        .collect();

    let mut unmix = vec![Complex64::new(0.0, 0.0); n_loc * nc];
    for (x, row) in rows.iter().enumerate() {
        for c in 0..nc {
            for y in 0..ny {
                unmix[x + y * nx + c * n_loc] = row[y + c * ny];
            }
        }
    }
    Ok(unmix)
}

/// Solve for a k-space unaliasing kernel from joint encoding relations
///
/// `kernel_mask` (shape = JER kernel shape, Fortran order) marks the
/// source offsets; the target is the kernel center. The Gram matrix `Rss`
/// and cross term `Rst` are read straight from the JER table, with
/// Tychonov regularization `reg_scale * trace(Rss) / numBasis` on the
/// diagonal. Returns a `[kx, ky, ncSource, ncTarget]` kernel, zero
/// outside the masked offsets.
pub fn compute_kspace_unaliasing_coefficients(
    jer: &JerLookup,
    kernel_mask: &[bool],
    reg_scale: f64,
) -> Result<Vec<Complex64>> {
    let (wx, wy) = jer.kernel_shape;
    let nc = jer.nc;
    if kernel_mask.len() != wx * wy {
        return Err(ReconError::ShapeMismatch(format!(
            "kernel mask has {} entries, expected {} x {}",
            kernel_mask.len(),
            wx,
            wy
        )));
    }
    if reg_scale < 0.0 {
        return Err(ReconError::InvalidArgument(
            "regularization scale must be non-negative".into(),
        ));
    }

    let mut offsets = Vec::new();
    for ky in 0..wy {
        for kx in 0..wx {
            if kernel_mask[kx + ky * wx] {
                offsets.push((kx, ky));
            }
        }
    }
    if offsets.is_empty() {
        return Err(ReconError::InvalidArgument(
            "kernel mask selects no source offsets".into(),
        ));
    }
    let num_source = offsets.len();
    let num_basis = num_source * nc;
    let target = (wx >> 1, wy >> 1);

    // Basis index = source + numSource * channel
    let mut rss = vec![Complex64::new(0.0, 0.0); num_basis * num_basis];
    let mut rst = vec![Complex64::new(0.0, 0.0); num_basis * nc];
    for c2 in 0..nc {
        for (s2, &(kx2, ky2)) in offsets.iter().enumerate() {
            let col = s2 + num_source * c2;
            for c1 in 0..nc {
                for (s1, &(kx1, ky1)) in offsets.iter().enumerate() {
                    rss[(s1 + num_source * c1) + col * num_basis] =
                        jer.at(kx1, ky1, kx2, ky2, c1, c2);
                }
            }
        }
    }
    for cb in 0..nc {
        for ca in 0..nc {
            for (s1, &(kx1, ky1)) in offsets.iter().enumerate() {
                rst[(s1 + num_source * ca) + cb * num_basis] =
                    jer.at(kx1, ky1, target.0, target.1, ca, cb);
            }
        }
    }

    if reg_scale > 0.0 {
        let lambda = reg_scale * linalg::trace(&rss, num_basis).re / num_basis as f64;
        for b in 0..num_basis {
            rss[b + b * num_basis] += lambda;
        }
    }
    let weights = linalg::solve(&rss, &rst, num_basis, nc)?;

    let mut kernel = vec![Complex64::new(0.0, 0.0); wx * wy * nc * nc];
    for cb in 0..nc {
        for ca in 0..nc {
            for (s, &(kx, ky)) in offsets.iter().enumerate() {
                kernel[kx + ky * wx + wx * wy * (ca + nc * cb)] =
                    weights[(s + num_source * ca) + cb * num_basis];
            }
        }
    }
    Ok(kernel)
}

/// Merge a k-space unaliasing kernel with channel combination maps into
/// unmixing images
///
/// The kernel is transformed to image space (mirrored, unit scale) and
/// contracted with the ccm over the target channel axis.
pub fn compute_unmixing_images_from_kspace_kernels(
    kernel: &[Complex64],
    kernel_shape: (usize, usize),
    nc_source: usize,
    nc_target: usize,
    ccm: &[Complex64],
    nx: usize,
    ny: usize,
) -> Result<Vec<Complex64>> {
    let n_loc = nx * ny;
    if ccm.len() != n_loc * nc_target {
        return Err(ReconError::ShapeMismatch(format!(
            "ccm has {} elements, expected {} x {} x {}",
            ccm.len(),
            nx,
            ny,
            nc_target
        )));
    }
    let im_kernel = fft::transform_kernel_to_image_space(
        kernel,
        &[kernel_shape.0, kernel_shape.1, nc_source, nc_target],
        (nx, ny),
    )?;

    let mut unmix = vec![Complex64::new(0.0, 0.0); n_loc * nc_source];
    for cs in 0..nc_source {
        for ct in 0..nc_target {
            for loc in 0..n_loc {
                unmix[loc + cs * n_loc] +=
                    im_kernel[loc + n_loc * (cs + nc_source * ct)] * ccm[loc + ct * n_loc];
            }
        }
    }
    Ok(unmix)
}

/// JER-based unmixing images for a uniform acceleration factor
///
/// For each of the `acc - 1` nontrivial aliasing shifts, fits a k-space
/// kernel whose sources sit on the matching ky sub-lattice, adds the
/// identity kernel at the target location (the acquired sample passes
/// through unchanged) and merges the summed kernel with the channel
/// combination maps.
pub fn compute_jer_unmixing(
    jer: &JerLookup,
    acc: usize,
    ccm: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    reg_scale: f64,
) -> Result<Vec<Complex64>> {
    if nc != jer.nc {
        return Err(ReconError::ShapeMismatch(format!(
            "ccm has {} channels but JER table has {}",
            nc, jer.nc
        )));
    }
    if acc == 0 {
        return Err(ReconError::InvalidArgument(
            "acceleration factor must be nonzero".into(),
        ));
    }
    let (wx, wy) = jer.kernel_shape;
    let target = (wx >> 1, wy >> 1);

    debug!(acc, kernel = ?jer.kernel_shape, "calculating unaliasing kernels");
    let mut kernel = vec![Complex64::new(0.0, 0.0); wx * wy * nc * nc];
    for c in 0..nc {
        kernel[target.0 + target.1 * wx + wx * wy * (c + nc * c)] = Complex64::new(1.0, 0.0);
    }
    for s in 0..acc.saturating_sub(1) {
        let mut mask = vec![false; wx * wy];
        for ky in (s..wy).step_by(acc) {
            for kx in 0..wx {
                mask[kx + ky * wx] = true;
            }
        }
        let shift_kernel = compute_kspace_unaliasing_coefficients(jer, &mask, reg_scale)?;
        for (dst, src) in kernel.iter_mut().zip(shift_kernel.iter()) {
            *dst += src;
        }
    }

    debug!("merging unaliasing kernels with channel combination maps");
    compute_unmixing_images_from_kspace_kernels(&kernel, (wx, wy), nc, nc, ccm, nx, ny)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jer;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn random_csm(n_loc: usize, nc: usize, seed: u64) -> Vec<Complex64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n_loc * nc)
            .map(|_| Complex64::new(rng.gen::<f64>() + 0.2, rng.gen::<f64>() - 0.5))
            .collect()
    }

    #[test]
    fn test_sense_acc_one_has_unity_gain() {
        // No acceleration: the unmixing row is the matched filter with
        // unity signal gain at every location.
        let (nx, ny, nc) = (3, 4, 3);
        let csm = random_csm(nx * ny, nc, 2);
        let unmix = compute_sense_unmixing(1, &csm, nx, ny, nc, None, 0.0).unwrap();
        for loc in 0..nx * ny {
            let gain: Complex64 = (0..nc)
                .map(|ch| unmix[loc + ch * nx * ny] * csm[loc + ch * nx * ny])
                .sum();
            assert!((gain - c(1.0, 0.0)).norm() < 1e-10, "gain = {}", gain);
        }
    }

    #[test]
    fn test_sense_recovers_aliased_signal() {
        // Algebraic aliasing: summed replicas weighted by the csm are
        // exactly separated by the unregularized solve.
        let (nx, ny, nc, acc) = (4, 8, 4, 2);
        let n_loc = nx * ny;
        let csm = random_csm(n_loc, nc, 7);
        let rho: Vec<Complex64> = random_csm(n_loc, 1, 9);
        let num_blocks = ny / acc;

        let unmix = compute_sense_unmixing(acc, &csm, nx, ny, nc, None, 0.0).unwrap();

        for x in 0..nx {
            for block in 0..num_blocks {
                // Aliased channel vector at this reduced-FOV pixel
                let mut aliased = vec![c(0.0, 0.0); nc];
                for k in 0..acc {
                    let y = block + k * num_blocks;
                    for ch in 0..nc {
                        aliased[ch] += csm[x + y * nx + ch * n_loc] * rho[x + y * nx];
                    }
                }
                for k in 0..acc {
                    let y = block + k * num_blocks;
                    let recovered: Complex64 = (0..nc)
                        .map(|ch| unmix[x + y * nx + ch * n_loc] * aliased[ch])
                        .sum();
                    assert!(
                        (recovered - rho[x + y * nx]).norm() < 1e-9,
                        "pixel ({}, {}): {} vs {}",
                        x,
                        y,
                        recovered,
                        rho[x + y * nx]
                    );
                }
            }
        }
    }

    #[test]
    fn test_sense_zero_block_stays_zero() {
        let (nx, ny, nc, acc) = (1, 4, 2, 2);
        let mut csm = random_csm(nx * ny, nc, 4);
        // Zero out the whole aliasing group y = 1 and y = 3
        for ch in 0..nc {
            csm[0 + 1 * nx + ch * nx * ny] = c(0.0, 0.0);
            csm[0 + 3 * nx + ch * nx * ny] = c(0.0, 0.0);
        }
        let unmix = compute_sense_unmixing(acc, &csm, nx, ny, nc, None, 0.001).unwrap();
        for ch in 0..nc {
            assert_eq!(unmix[0 + 1 * nx + ch * nx * ny], c(0.0, 0.0));
            assert_eq!(unmix[0 + 3 * nx + ch * nx * ny], c(0.0, 0.0));
        }
    }

    #[test]
    fn test_identity_kernel_reduces_to_ccm() {
        // acc = 1: no aliasing shifts, the kernel is the identity at the
        // target and the unmixing images equal the ccm.
        let (nx, ny, nc) = (8, 8, 2);
        let csm = random_csm(nx * ny, nc, 5);
        let jer_table = jer::compute_jer_model_driven(&csm, nx, ny, nc, (3, 3)).unwrap();
        let ccm = random_csm(nx * ny, nc, 6);
        let unmix = compute_jer_unmixing(&jer_table, 1, &ccm, nx, ny, nc, 0.0).unwrap();
        for (u, m) in unmix.iter().zip(ccm.iter()) {
            assert!((u - m).norm() < 1e-9, "{} vs {}", u, m);
        }
    }

    #[test]
    fn test_kernel_solve_rejects_empty_mask() {
        let jer_table = JerLookup::new((3, 3), 1);
        let mask = vec![false; 9];
        assert!(compute_kspace_unaliasing_coefficients(&jer_table, &mask, 0.0).is_err());
    }
}
