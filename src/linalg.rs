//! Small dense complex linear algebra helpers
//!
//! All matrices are flat `Vec<Complex64>` buffers in Fortran (column-major)
//! order: element `(i, j)` of an `m x n` matrix lives at `i + j*m`. The
//! systems solved here are channel-count sized (typically 8 to 32), so
//! simple factorizations without blocking are appropriate.

use num_complex::Complex64;

use crate::error::{ReconError, Result};

/// Hermitian positive definite Cholesky factorization, `A = L * Lᴴ`
///
/// Returns the lower-triangular factor `L` (upper triangle zeroed).
/// Fails with [`ReconError::NotPositiveDefinite`] when a pivot is not
/// strictly positive, which for covariance inputs indicates invalid data.
pub fn cholesky(a: &[Complex64], n: usize) -> Result<Vec<Complex64>> {
    check_square(a.len(), n)?;
    let mut l = vec![Complex64::new(0.0, 0.0); n * n];
    for j in 0..n {
        let mut d = a[j + j * n].re;
        for k in 0..j {
            d -= l[j + k * n].norm_sqr();
        }
        if !(d > 0.0) || !d.is_finite() {
            return Err(ReconError::NotPositiveDefinite(format!(
                "Cholesky pivot {} is {:.3e}",
                j, d
            )));
        }
        let dsqrt = d.sqrt();
        l[j + j * n] = Complex64::new(dsqrt, 0.0);
        for i in (j + 1)..n {
            let mut s = a[i + j * n];
            for k in 0..j {
                s -= l[i + k * n] * l[j + k * n].conj();
            }
            l[i + j * n] = s / dsqrt;
        }
    }
    Ok(l)
}

/// Inverse of a lower-triangular matrix by forward substitution
pub fn invert_lower(l: &[Complex64], n: usize) -> Result<Vec<Complex64>> {
    check_square(l.len(), n)?;
    for j in 0..n {
        if l[j + j * n].norm() == 0.0 {
            return Err(ReconError::Singular(format!(
                "triangular matrix has zero diagonal at {}",
                j
            )));
        }
    }
    let mut m = vec![Complex64::new(0.0, 0.0); n * n];
    for j in 0..n {
        m[j + j * n] = Complex64::new(1.0, 0.0) / l[j + j * n];
        for i in (j + 1)..n {
            let mut s = Complex64::new(0.0, 0.0);
            for k in j..i {
                s += l[i + k * n] * m[k + j * n];
            }
            m[i + j * n] = -s / l[i + i * n];
        }
    }
    Ok(m)
}

/// Inverse of a Hermitian positive definite matrix via Cholesky,
/// `A⁻¹ = L⁻ᴴ * L⁻¹`
pub fn invert_hpd(a: &[Complex64], n: usize) -> Result<Vec<Complex64>> {
    let l = cholesky(a, n)?;
    let m = invert_lower(&l, n)?;
    let mut inv = vec![Complex64::new(0.0, 0.0); n * n];
    for j in 0..n {
        for i in 0..n {
            let mut s = Complex64::new(0.0, 0.0);
            // (Mᴴ M)[i,j]; M is lower triangular so k starts at max(i, j)
            for k in i.max(j)..n {
                s += m[k + i * n].conj() * m[k + j * n];
            }
            inv[i + j * n] = s;
        }
    }
    Ok(inv)
}

/// Solve `A X = B` by Gaussian elimination with partial pivoting
///
/// `a` is `n x n`, `b` is `n x nrhs`, both column-major. Neither input is
/// modified.
pub fn solve(a: &[Complex64], b: &[Complex64], n: usize, nrhs: usize) -> Result<Vec<Complex64>> {
    check_square(a.len(), n)?;
    if b.len() != n * nrhs {
        return Err(ReconError::ShapeMismatch(format!(
            "rhs has {} elements, expected {} x {}",
            b.len(),
            n,
            nrhs
        )));
    }
    let mut m = a.to_vec();
    let mut x = b.to_vec();

    for col in 0..n {
        // Partial pivot on the largest remaining magnitude
        let mut pivot = col;
        let mut best = m[col + col * n].norm();
        for row in (col + 1)..n {
            let mag = m[row + col * n].norm();
            if mag > best {
                best = mag;
                pivot = row;
            }
        }
        if best == 0.0 {
            return Err(ReconError::Singular(format!(
                "elimination found a zero pivot column at {}",
                col
            )));
        }
        if pivot != col {
            for j in 0..n {
                m.swap(col + j * n, pivot + j * n);
            }
            for j in 0..nrhs {
                x.swap(col + j * n, pivot + j * n);
            }
        }
        let diag = m[col + col * n];
        for row in (col + 1)..n {
            let factor = m[row + col * n] / diag;
            if factor.norm() == 0.0 {
                continue;
            }
            for j in col..n {
                let v = m[col + j * n];
                m[row + j * n] -= factor * v;
            }
            for j in 0..nrhs {
                let v = x[col + j * n];
                x[row + j * n] -= factor * v;
            }
        }
    }

    // Back substitution
    for col in (0..n).rev() {
        let diag = m[col + col * n];
        for j in 0..nrhs {
            let mut s = x[col + j * n];
            for k in (col + 1)..n {
                s -= m[col + k * n] * x[k + j * n];
            }
            x[col + j * n] = s / diag;
        }
    }
    Ok(x)
}

/// Solve a Hermitian system whose zero-diagonal rows carry no signal
///
/// Rows and columns with an exactly zero diagonal are excluded from the
/// solve and the corresponding solution entries are left at zero. If the
/// reduced system is still singular the whole solution is zero-filled,
/// matching the pseudo-inverse behavior on degenerate aliasing blocks.
pub fn solve_hermitian_guarded(
    a: &[Complex64],
    b: &[Complex64],
    n: usize,
    nrhs: usize,
) -> Vec<Complex64> {
    let active: Vec<usize> = (0..n).filter(|&i| a[i + i * n].norm() > 0.0).collect();
    let na = active.len();
    let mut x = vec![Complex64::new(0.0, 0.0); n * nrhs];
    if na == 0 {
        return x;
    }

    let mut ra = vec![Complex64::new(0.0, 0.0); na * na];
    let mut rb = vec![Complex64::new(0.0, 0.0); na * nrhs];
    for (jj, &j) in active.iter().enumerate() {
        for (ii, &i) in active.iter().enumerate() {
            ra[ii + jj * na] = a[i + j * n];
        }
    }
    for j in 0..nrhs {
        for (ii, &i) in active.iter().enumerate() {
            rb[ii + j * na] = b[i + j * n];
        }
    }

    match solve(&ra, &rb, na, nrhs) {
        Ok(rx) => {
            for j in 0..nrhs {
                for (ii, &i) in active.iter().enumerate() {
                    x[i + j * n] = rx[ii + j * na];
                }
            }
            x
        }
        Err(_) => vec![Complex64::new(0.0, 0.0); n * nrhs],
    }
}

/// Solve a real 3x3 system, returning `None` when it is singular
pub fn solve3_real(a: &[f64; 9], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut m = *a;
    let mut x = *b;
    for col in 0..3 {
        let mut pivot = col;
        for row in (col + 1)..3 {
            if m[row + col * 3].abs() > m[pivot + col * 3].abs() {
                pivot = row;
            }
        }
        if m[pivot + col * 3].abs() < 1e-14 {
            return None;
        }
        if pivot != col {
            for j in 0..3 {
                m.swap(col + j * 3, pivot + j * 3);
            }
            x.swap(col, pivot);
        }
        for row in (col + 1)..3 {
            let factor = m[row + col * 3] / m[col + col * 3];
            for j in col..3 {
                m[row + j * 3] -= factor * m[col + j * 3];
            }
            x[row] -= factor * x[col];
        }
    }
    for col in (0..3).rev() {
        let mut s = x[col];
        for k in (col + 1)..3 {
            s -= m[col + k * 3] * x[k];
        }
        x[col] = s / m[col + col * 3];
    }
    Some(x)
}

/// Column-major matrix product, `C (m x n) = A (m x k) * B (k x n)`
pub fn matmul(
    a: &[Complex64],
    b: &[Complex64],
    m: usize,
    k: usize,
    n: usize,
) -> Vec<Complex64> {
    let mut c = vec![Complex64::new(0.0, 0.0); m * n];
    for j in 0..n {
        for p in 0..k {
            let bv = b[p + j * k];
            if bv.norm() == 0.0 {
                continue;
            }
            for i in 0..m {
                c[i + j * m] += a[i + p * m] * bv;
            }
        }
    }
    c
}

/// Trace of a square matrix
pub fn trace(a: &[Complex64], n: usize) -> Complex64 {
    (0..n).map(|i| a[i + i * n]).sum()
}

fn check_square(len: usize, n: usize) -> Result<()> {
    if len != n * n {
        return Err(ReconError::ShapeMismatch(format!(
            "matrix has {} elements, expected {n} x {n}",
            len
        )));
    }
    Ok(())
}
