//! Calibration data handling: sampling pattern synthesis, sampling masks
//! and extraction of the fully sampled calibration region
//!
//! Sampling pattern codes: 0 = unacquired, 1 = accelerated line,
//! 2 = reference (calibration) line, 3 = both.

use num_complex::Complex64;

use crate::error::{ReconError, Result};

/// Code for an unacquired k-space line
pub const SAMPLING_NONE: u8 = 0;
/// Code for a line acquired by the accelerated scan
pub const SAMPLING_ACCELERATED: u8 = 1;
/// Code for a reference (calibration) line
pub const SAMPLING_REFERENCE: u8 = 2;
/// Code for a line that is both accelerated and reference
pub const SAMPLING_BOTH: u8 = 3;

/// Generate an accelerated sampling pattern with centered reference lines
///
/// Every `acc`-th ky line starting at `shift mod acc` is marked
/// accelerated; `num_ref` contiguous ky lines centered in k-space are
/// marked reference. Output shape `[nx, ny]`.
pub fn generate_accelerated_sampling_pattern(
    nx: usize,
    ny: usize,
    acc: usize,
    num_ref: usize,
    shift: usize,
) -> Result<Vec<u8>> {
    if acc == 0 || acc > ny {
        return Err(ReconError::InvalidArgument(format!(
            "acceleration factor {} invalid for {} phase-encode lines",
            acc, ny
        )));
    }
    if num_ref > ny {
        return Err(ReconError::InvalidArgument(format!(
            "{} reference lines do not fit in {} phase-encode lines",
            num_ref, ny
        )));
    }
    let shift = shift % acc;
    let ref_start = (ny - num_ref) / 2;
    let ref_end = ref_start + num_ref;

    let mut pattern = vec![SAMPLING_NONE; nx * ny];
    for y in 0..ny {
        let mut code = 0u8;
        if y % acc == shift {
            code += SAMPLING_ACCELERATED;
        }
        if y >= ref_start && y < ref_end {
            code += SAMPLING_REFERENCE;
        }
        if code != 0 {
            for x in 0..nx {
                pattern[x + y * nx] = code;
            }
        }
    }
    Ok(pattern)
}

/// Boolean mask of pattern locations whose code satisfies `keep`
pub fn sampling_mask_from_pattern(pattern: &[u8], keep: impl Fn(u8) -> bool) -> Vec<bool> {
    pattern.iter().map(|&code| keep(code)).collect()
}

/// Zero k-space samples outside the mask, channel by channel
pub fn apply_sampling_mask(
    kspace: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    mask: &[bool],
) -> Result<Vec<Complex64>> {
    if kspace.len() != nx * ny * nc || mask.len() != nx * ny {
        return Err(ReconError::ShapeMismatch(format!(
            "kspace {} / mask {} inconsistent with {} x {} x {}",
            kspace.len(),
            mask.len(),
            nx,
            ny,
            nc
        )));
    }
    let n_loc = nx * ny;
    let mut out = kspace.to_vec();
    for c in 0..nc {
        for loc in 0..n_loc {
            if !mask[loc] {
                out[loc + c * n_loc] = Complex64::new(0.0, 0.0);
            }
        }
    }
    Ok(out)
}

/// Hamming window of length `n`
pub fn hamming(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|k| 0.54 - 0.46 * (2.0 * std::f64::consts::PI * k as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Extract the fully sampled calibration sub-array from accelerated data
///
/// The calibration support is the maximal contiguous span of fully
/// sampled rows and columns: pattern codes above [`SAMPLING_ACCELERATED`]
/// when a pattern is given, nonzero data magnitude otherwise. Projections
/// are cleaned with a 1-D morphological opening (structuring element of
/// length 3) first, so isolated speckles do not masquerade as calibration
/// lines. `max_readout_width` forces the readout (x) extent to exactly
/// that width, centered on the detected span.
///
/// Returns the calibration data `[cx, cy, nc]` and its extents `(cx, cy)`.
pub fn extract_cal_data(
    data: &[Complex64],
    nx: usize,
    ny: usize,
    nc: usize,
    pattern: Option<&[u8]>,
    max_readout_width: Option<usize>,
) -> Result<(Vec<Complex64>, (usize, usize))> {
    if data.len() != nx * ny * nc {
        return Err(ReconError::ShapeMismatch(format!(
            "data has {} elements, expected {} x {} x {}",
            data.len(),
            nx,
            ny,
            nc
        )));
    }
    if let Some(p) = pattern {
        if p.len() != nx * ny {
            return Err(ReconError::ShapeMismatch(format!(
                "pattern has {} elements, expected {} x {}",
                p.len(),
                nx,
                ny
            )));
        }
    }
    let n_loc = nx * ny;

    // Fully sampled support per location
    let support = |x: usize, y: usize| -> bool {
        match pattern {
            Some(p) => p[x + y * nx] > SAMPLING_ACCELERATED,
            None => (0..nc).any(|c| data[x + y * nx + c * n_loc].norm() > 0.0),
        }
    };

    let mut kx_proj = vec![false; nx];
    let mut ky_proj = vec![false; ny];
    for y in 0..ny {
        for x in 0..nx {
            if support(x, y) {
                kx_proj[x] = true;
                ky_proj[y] = true;
            }
        }
    }
    let kx_proj = open_1d(&kx_proj);
    let ky_proj = open_1d(&ky_proj);

    let (mut x0, mut x1) = longest_run(&kx_proj).ok_or_else(|| {
        ReconError::InvalidArgument("no calibration region found along kx".into())
    })?;
    let (y0, y1) = longest_run(&ky_proj).ok_or_else(|| {
        ReconError::InvalidArgument("no calibration region found along ky".into())
    })?;

    if let Some(width) = max_readout_width {
        if width == 0 || width > nx {
            return Err(ReconError::InvalidArgument(format!(
                "requested readout width {} invalid for {} samples",
                width, nx
            )));
        }
        let center = (x0 + x1) / 2;
        x0 = center.saturating_sub(width / 2).min(nx - width);
        x1 = x0 + width;
    }

    let (cx, cy) = (x1 - x0, y1 - y0);
    let mut cal = vec![Complex64::new(0.0, 0.0); cx * cy * nc];
    for c in 0..nc {
        for y in 0..cy {
            for x in 0..cx {
                cal[x + y * cx + c * cx * cy] = data[(x0 + x) + (y0 + y) * nx + c * n_loc];
            }
        }
    }
    Ok((cal, (cx, cy)))
}

// Morphological opening (erosion then dilation) with a length-3
// structuring element; removes isolated single-sample speckles.
fn open_1d(mask: &[bool]) -> Vec<bool> {
    let n = mask.len();
    if n < 3 {
        return mask.to_vec();
    }
    let at = |m: &[bool], i: isize| -> bool {
        if i < 0 || i as usize >= n {
            false
        } else {
            m[i as usize]
        }
    };
    let eroded: Vec<bool> = (0..n as isize)
        .map(|i| at(mask, i - 1) && at(mask, i) && at(mask, i + 1))
        .collect();
    (0..n as isize)
        .map(|i| at(&eroded, i - 1) || at(&eroded, i) || at(&eroded, i + 1))
        .collect()
}

// Longest contiguous run of true values, as a half-open [start, end) range
fn longest_run(mask: &[bool]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;
    for (i, &v) in mask.iter().enumerate() {
        match (v, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if best.map_or(true, |(bs, be)| i - s > be - bs) {
                    best = Some((s, i));
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        let i = mask.len();
        if best.map_or(true, |(bs, be)| i - s > be - bs) {
            best = Some((s, i));
        }
    }
    best
}
