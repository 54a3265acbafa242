//! Joint encoding relations (JER): correlations between k-space kernel
//! sample offsets, the calibration input to GRAPPA/PARS kernel fitting
//!
//! The lookup is a 6-D tensor over two kernel offsets and two channels.
//! It can be derived analytically from sensitivity maps (model driven) or
//! estimated from calibration k-space samples (data driven). Both paths
//! fill the same [`JerLookup`] table.

use num_complex::Complex64;
use rayon::prelude::*;

use crate::error::{ReconError, Result};
use crate::fft::{self, FtOptions};

/// Lookup table of joint encoding relations
///
/// Entry `(kxa, kya, kxb, kyb, ca, cb)` is the correlation between sample
/// offset `(kxa, kya)` of channel `ca` and offset `(kxb, kyb)` of channel
/// `cb`, stored flat in Fortran order. A correct table satisfies the
/// conjugate symmetry `at(a, b, ca, cb) == conj(at(b, a, cb, ca))`; the
/// data-driven construction does not enforce it, so it doubles as a
/// consistency check.
#[derive(Debug, Clone)]
pub struct JerLookup {
    /// Kernel extent `(wx, wy)` on the fully sampled grid
    pub kernel_shape: (usize, usize),
    /// Number of channels
    pub nc: usize,
    data: Vec<Complex64>,
}

impl JerLookup {
    pub fn new(kernel_shape: (usize, usize), nc: usize) -> Self {
        let (wx, wy) = kernel_shape;
        Self {
            kernel_shape,
            nc,
            data: vec![Complex64::new(0.0, 0.0); wx * wy * wx * wy * nc * nc],
        }
    }

    #[inline(always)]
    fn index(&self, kxa: usize, kya: usize, kxb: usize, kyb: usize, ca: usize, cb: usize) -> usize {
        let (wx, wy) = self.kernel_shape;
        kxa + wx * (kya + wy * (kxb + wx * (kyb + wy * (ca + self.nc * cb))))
    }

    #[inline(always)]
    pub fn at(&self, kxa: usize, kya: usize, kxb: usize, kyb: usize, ca: usize, cb: usize) -> Complex64 {
        self.data[self.index(kxa, kya, kxb, kyb, ca, cb)]
    }

    #[inline(always)]
    pub fn at_mut(
        &mut self,
        kxa: usize,
        kya: usize,
        kxb: usize,
        kyb: usize,
        ca: usize,
        cb: usize,
    ) -> &mut Complex64 {
        let i = self.index(kxa, kya, kxb, kyb, ca, cb);
        &mut self.data[i]
    }
}

/// Model-driven JER from coil sensitivity maps
///
/// For each channel pair, the unit-scale Fourier transform of
/// `conj(csm_a) * csm_b` is sampled at the centered offset difference
/// `(kxb - kxa, kyb - kya)`. See Beatty, Reconstruction methods for fast
/// magnetic resonance imaging, PhD thesis, Stanford University, 2006.
pub fn compute_jer_model_driven(
    csm: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    kernel_shape: (usize, usize),
) -> Result<JerLookup> {
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
    let (wx, wy) = kernel_shape;
    // Sampled offsets nx/2 + (kxb - kxa) must stay inside the grid
    if wx == 0 || wy == 0 || nx / 2 + wx > nx || wx > nx / 2 + 1 || ny / 2 + wy > ny || wy > ny / 2 + 1
    {
        return Err(ReconError::InvalidArgument(format!(
            "kernel {:?} exceeds image extent {} x {}",
            kernel_shape, nx, ny
        )));
    }

    let mut lookup = JerLookup::new(kernel_shape, nc);
    let per_cb = wx * wy * wx * wy * nc;
    let opts = FtOptions {
        scale: Some(vec![1.0, 1.0]),
        ..Default::default()
    };

    // Channel pairs are independent; parallelize over the outermost
    // (target channel) stride of the table.
    lookup
        .data
        .par_chunks_mut(per_cb)
        .enumerate()
        .try_for_each(|(cb, chunk)| -> Result<()> {
            for ca in 0..nc {
                let mut product = vec![Complex64::new(0.0, 0.0); n_loc];
                for loc in 0..n_loc {
                    product[loc] = csm[loc + ca * n_loc].conj() * csm[loc + cb * n_loc];
                }
                let (kspace, _) = fft::transform_image_to_kspace(&product, &[nx, ny], &[0, 1], &opts)?;
                for kyb in 0..wy {
                    for kxb in 0..wx {
                        for kya in 0..wy {
                            for kxa in 0..wx {
                                let x = nx / 2 + kxb - kxa;
                                let y = ny / 2 + kyb - kya;
                                chunk[kxa + wx * (kya + wy * (kxb + wx * (kyb + wy * ca)))] =
                                    kspace[x + y * nx];
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;
    Ok(lookup)
}

/// Data-driven JER by direct summation over every kernel placement
///
/// Computes each table entry independently as a sum over all fully
/// contained kernel placements in the calibration region. Quadratically
/// redundant; kept as the correctness oracle for
/// [`compute_jer_data_driven`], which must match it to floating tolerance.
pub fn compute_jer_data_driven_reference(
    cal: &[Complex64],
    cx: usize,
    cy: usize,
    nc: usize,
    kernel_shape: (usize, usize),
) -> Result<JerLookup> {
    check_cal(cal, cx, cy, nc, kernel_shape)?;
    let (wx, wy) = kernel_shape;
    let n_loc = cx * cy;
    let nfit = (cx - wx + 1, cy - wy + 1);

    let mut lookup = JerLookup::new(kernel_shape, nc);
    for cb in 0..nc {
        for ca in 0..nc {
            for kyb in 0..wy {
                for kxb in 0..wx {
                    for kya in 0..wy {
                        for kxa in 0..wx {
                            let mut s = Complex64::new(0.0, 0.0);
                            for y0 in 0..nfit.1 {
                                for x0 in 0..nfit.0 {
                                    let a = cal[(kxa + x0) + (kya + y0) * cx + ca * n_loc];
                                    let b = cal[(kxb + x0) + (kyb + y0) * cx + cb * n_loc];
                                    s += a.conj() * b;
                                }
                            }
                            *lookup.at_mut(kxa, kya, kxb, kyb, ca, cb) = s;
                        }
                    }
                }
            }
        }
    }
    Ok(lookup)
}

/// Data-driven JER with partial sums shared across equal offset differences
///
/// JERs depend on the two offsets only through their difference, so all
/// pairs sharing a `(dkx, dky)` are computed from one set of grouped
/// partial sums over the shifted-product image. Near the calibration
/// edges the group extents are clipped to the available data. See Beatty
/// et al., Proc. ISMRM 2007, p1749.
pub fn compute_jer_data_driven(
    cal: &[Complex64],
    cx: usize,
    cy: usize,
    nc: usize,
    kernel_shape: (usize, usize),
) -> Result<JerLookup> {
    check_cal(cal, cx, cy, nc, kernel_shape)?;
    let (wx, wy) = kernel_shape;
    let n_loc = cx * cy;
    let mut lookup = JerLookup::new(kernel_shape, nc);

    let wxi = wx as isize;
    let wyi = wy as isize;
    for dky in (1 - wyi)..wyi {
        for dkx in (1 - wxi)..wxi {
            let adx = dkx.unsigned_abs();
            let ady = dky.unsigned_abs();
            let n_data = (cx - adx, cy - ady);
            let n_groups = (
                (2 * (wx - adx) - 1).min(n_data.0),
                (2 * (wy - ady) - 1).min(n_data.1),
            );
            let gx = group_map(n_data.0, n_groups.0);
            let gy = group_map(n_data.1, n_groups.1);
            let a_min = (dkx.min(0).unsigned_abs(), dky.min(0).unsigned_abs());

            // Partial sums over the shifted product, one bucket per group
            let mut partial =
                vec![Complex64::new(0.0, 0.0); n_groups.0 * n_groups.1 * nc * nc];
            for cb in 0..nc {
                for ca in 0..nc {
                    let base = (ca + nc * cb) * n_groups.0 * n_groups.1;
                    for jy in 0..n_data.1 {
                        let ya = a_min.1 + jy;
                        let yb = (ya as isize + dky) as usize;
                        let g2 = gy[jy];
                        for jx in 0..n_data.0 {
                            let xa = a_min.0 + jx;
                            let xb = (xa as isize + dkx) as usize;
                            let a = cal[xa + ya * cx + ca * n_loc];
                            let b = cal[xb + yb * cx + cb * n_loc];
                            partial[base + gx[jx] + g2 * n_groups.0] += a.conj() * b;
                        }
                    }
                }
            }

            // Each kernel offset pair with this delta sums a window of
            // groups, clipped to the calibration extent at the edges.
            let nsums = (wx - adx, wy - ady);
            let sum_size = (nsums.0.min(cx - wx + 1), nsums.1.min(cy - wy + 1));
            for cb in 0..nc {
                for ca in 0..nc {
                    let base = (ca + nc * cb) * n_groups.0 * n_groups.1;
                    for iky in 0..nsums.1 {
                        for ikx in 0..nsums.0 {
                            let mut s = Complex64::new(0.0, 0.0);
                            for g2 in iky..(iky + sum_size.1) {
                                for g1 in ikx..(ikx + sum_size.0) {
                                    s += partial[base + g1 + g2 * n_groups.0];
                                }
                            }
                            let kxa = a_min.0 + ikx;
                            let kya = a_min.1 + iky;
                            let kxb = (kxa as isize + dkx) as usize;
                            let kyb = (kya as isize + dky) as usize;
                            *lookup.at_mut(kxa, kya, kxb, kyb, ca, cb) = s;
                        }
                    }
                }
            }
        }
    }
    Ok(lookup)
}

// Maps each of n_data shifted-product indices to one of n_groups partial
// sum buckets: the leading and trailing groups are singletons, the middle
// bucket absorbs the interior run.
fn group_map(n_data: usize, n_groups: usize) -> Vec<usize> {
    let half = n_groups >> 1;
    let surplus = n_data - n_groups;
    (0..n_data)
        .map(|j| {
            if j < half {
                j
            } else if j <= half + surplus {
                half
            } else {
                j - surplus
            }
        })
        .collect()
}

fn check_cal(
    cal: &[Complex64],
    cx: usize,
    cy: usize,
    nc: usize,
    kernel_shape: (usize, usize),
) -> Result<()> {
    if cal.len() != cx * cy * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "calibration data has {} elements, expected {} x {} x {}",
            cal.len(),
            cx,
            cy,
            nc
        )));
    }
    if kernel_shape.0 > cx || kernel_shape.1 > cy || kernel_shape.0 == 0 || kernel_shape.1 == 0 {
        return Err(ReconError::InvalidArgument(format!(
            "kernel {:?} does not fit calibration extent {} x {}",
            kernel_shape, cx, cy
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_cal(cx: usize, cy: usize, nc: usize, seed: u64) -> Vec<Complex64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..cx * cy * nc)
            .map(|_| Complex64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5))
            .collect()
    }

    fn assert_tables_match(a: &JerLookup, b: &JerLookup, tol: f64) {
        let (wx, wy) = a.kernel_shape;
        for cb in 0..a.nc {
            for ca in 0..a.nc {
                for kyb in 0..wy {
                    for kxb in 0..wx {
                        for kya in 0..wy {
                            for kxa in 0..wx {
                                let va = a.at(kxa, kya, kxb, kyb, ca, cb);
                                let vb = b.at(kxa, kya, kxb, kyb, ca, cb);
                                assert!(
                                    (va - vb).norm() < tol,
                                    "mismatch at ({},{},{},{},{},{}): {} vs {}",
                                    kxa,
                                    kya,
                                    kxb,
                                    kyb,
                                    ca,
                                    cb,
                                    va,
                                    vb
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_grouped_path_matches_reference() {
        let (cx, cy, nc) = (12, 10, 2);
        let cal = random_cal(cx, cy, nc, 3);
        let fast = compute_jer_data_driven(&cal, cx, cy, nc, (4, 3)).unwrap();
        let reference = compute_jer_data_driven_reference(&cal, cx, cy, nc, (4, 3)).unwrap();
        assert_tables_match(&fast, &reference, 1e-10);
    }

    #[test]
    fn test_grouped_path_matches_reference_tight_cal() {
        // Calibration barely larger than the kernel: the edge-clipping
        // branch of the group sums is exercised everywhere.
        let (cx, cy, nc) = (5, 4, 2);
        let cal = random_cal(cx, cy, nc, 11);
        let fast = compute_jer_data_driven(&cal, cx, cy, nc, (5, 3)).unwrap();
        let reference = compute_jer_data_driven_reference(&cal, cx, cy, nc, (5, 3)).unwrap();
        assert_tables_match(&fast, &reference, 1e-10);
    }

    #[test]
    fn test_data_driven_conjugate_symmetry() {
        let (cx, cy, nc) = (10, 10, 2);
        let cal = random_cal(cx, cy, nc, 5);
        let jer = compute_jer_data_driven(&cal, cx, cy, nc, (3, 3)).unwrap();
        for cb in 0..nc {
            for ca in 0..nc {
                for kyb in 0..3 {
                    for kxb in 0..3 {
                        for kya in 0..3 {
                            for kxa in 0..3 {
                                let fwd = jer.at(kxa, kya, kxb, kyb, ca, cb);
                                let rev = jer.at(kxb, kyb, kxa, kya, cb, ca);
                                assert!((fwd - rev.conj()).norm() < 1e-10);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_model_driven_uniform_sensitivity() {
        // Constant unit csm: the channel-pair product transforms to a
        // delta at DC, so equal offsets give nx*ny and others give zero.
        let (nx, ny) = (8, 8);
        let csm = vec![Complex64::new(1.0, 0.0); nx * ny];
        let jer = compute_jer_model_driven(&csm, nx, ny, 1, (3, 3)).unwrap();
        for kyb in 0..3 {
            for kxb in 0..3 {
                for kya in 0..3 {
                    for kxa in 0..3 {
                        let v = jer.at(kxa, kya, kxb, kyb, 0, 0);
                        if kxa == kxb && kya == kyb {
                            assert!((v.re - (nx * ny) as f64).abs() < 1e-9);
                            assert!(v.im.abs() < 1e-9);
                        } else {
                            assert!(v.norm() < 1e-9, "expected zero, got {}", v);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_kernel_larger_than_cal_is_an_error() {
        let cal = random_cal(4, 4, 1, 1);
        assert!(compute_jer_data_driven(&cal, 4, 4, 1, (5, 3)).is_err());
    }
}
