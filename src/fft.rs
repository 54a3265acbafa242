//! Shift-aware multi-dimensional Fourier transforms using rustfft
//!
//! All arrays are dense complex buffers in Fortran (column-major) order
//! with explicit shape arguments. The engine composes 1-D transforms
//! along the requested axes; each axis transform supports an output
//! extent different from the input extent (zero-padding or cropping
//! through a longer FFT) and real-valued pre/post sample shifts realized
//! as linear phase ramps, so data never has to be pre-centered in memory.
//!
//! Conventions: the forward direction is image -> k-space. The backward
//! direction applies an unnormalized inverse FFT multiplied by the FFT
//! length, so that the default per-axis scale of `1/sqrt(N)` makes
//! forward/backward a unitary pair.

use num_complex::Complex64;
use rustfft::{FftDirection, FftPlanner};
use std::f64::consts::PI;

use crate::error::{ReconError, Result};

/// Transform direction: Forward = image to k-space, Backward = k-space to image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    Forward,
    Backward,
}

/// Optional per-axis parameters for [`multi_dim_fourier_transform`]
///
/// Any field left as `None` takes the centered-unitary default:
/// output shape = input shape, scale = `1/sqrt(inputExtent)`,
/// FFT extent = input extent, pre-shift = `-floor(inputExtent/2)`,
/// post-shift = `floor(outputExtent/2)`.
/// Provided vectors must have one entry per array dimension; entries on
/// axes not being transformed are ignored.
#[derive(Debug, Clone, Default)]
pub struct FtOptions {
    pub output_shape: Option<Vec<usize>>,
    pub scale: Option<Vec<f64>>,
    pub fft_extent: Option<Vec<usize>>,
    pub pre_shift: Option<Vec<f64>>,
    pub post_shift: Option<Vec<f64>>,
}

/// Index into a 3-D array stored in Fortran order (column-major)
/// index = x + y*nx + c*nx*ny
#[inline(always)]
pub fn idx3(x: usize, y: usize, c: usize, nx: usize, ny: usize) -> usize {
    x + y * nx + c * nx * ny
}

/// Index into a 2-D array stored in Fortran order
#[inline(always)]
pub fn idx2(x: usize, y: usize, nx: usize) -> usize {
    x + y * nx
}

fn check_len(len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if len != expected {
        return Err(ReconError::ShapeMismatch(format!(
            "buffer has {} elements but shape {:?} requires {}",
            len, shape, expected
        )));
    }
    Ok(())
}

fn axis_option<T: Copy>(opt: &Option<Vec<T>>, axis: usize, ndim: usize) -> Result<Option<T>> {
    match opt {
        None => Ok(None),
        Some(v) => {
            if v.len() != ndim {
                return Err(ReconError::ShapeMismatch(format!(
                    "per-axis option has {} entries for a {}-dimensional array",
                    v.len(),
                    ndim
                )));
            }
            Ok(Some(v[axis]))
        }
    }
}

/// 1-D shift-aware Fourier transform along one axis of a Fortran-ordered array
///
/// The FFT length is `max(inputExtent, outputExtent, fftExtent)`; input
/// lines are implicitly zero-padded to that length and the output is
/// cropped to `out_extent`. The post-shift is applied as a linear phase
/// on the input side, the pre-shift as a linear phase on the output side,
/// together with the scalar cross term `exp(±2πi·preShift·postShift/Nfft)`.
#[allow(clippy::too_many_arguments)]
pub fn transform_axis(
    input: &[Complex64],
    shape: &[usize],
    axis: usize,
    out_extent: usize,
    scale: f64,
    fft_extent: usize,
    pre_shift: f64,
    post_shift: f64,
    direction: TransformDirection,
) -> Result<(Vec<Complex64>, Vec<usize>)> {
    check_len(input.len(), shape)?;
    if axis >= shape.len() {
        return Err(ReconError::InvalidArgument(format!(
            "axis {} out of range for {}-dimensional array",
            axis,
            shape.len()
        )));
    }
    let n_in = shape[axis];
    let n_out = out_extent;
    if n_in == 0 || n_out == 0 {
        return Err(ReconError::InvalidArgument(
            "transform extents must be nonzero".into(),
        ));
    }
    let n_ft = n_in.max(n_out).max(fft_extent);

    // Sign of the twiddle coefficient; forward uses +2*pi*i
    let twiddle = match direction {
        TransformDirection::Forward => 1.0,
        TransformDirection::Backward => -1.0,
    };

    // Linear phase ramps realizing the fractional (and integer) shifts
    let in_phase: Vec<Complex64> = (0..n_in)
        .map(|x| {
            Complex64::from_polar(1.0, twiddle * 2.0 * PI * x as f64 * post_shift / n_ft as f64)
        })
        .collect();
    let shift_scale = Complex64::from_polar(
        scale,
        twiddle * 2.0 * PI * pre_shift * post_shift / n_ft as f64,
    );
    let out_phase: Vec<Complex64> = (0..n_out)
        .map(|x| {
            shift_scale
                * Complex64::from_polar(
                    1.0,
                    -twiddle * 2.0 * PI * x as f64 * pre_shift / n_ft as f64,
                )
        })
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    // rustfft's inverse transform is unnormalized, which already matches
    // the backward convention of Nfft * ifft.
    let fft = match direction {
        TransformDirection::Forward => planner.plan_fft(n_ft, FftDirection::Forward),
        TransformDirection::Backward => planner.plan_fft(n_ft, FftDirection::Inverse),
    };
    let mut scratch = vec![Complex64::new(0.0, 0.0); fft.get_inplace_scratch_len()];
    let mut line = vec![Complex64::new(0.0, 0.0); n_ft];

    let mut out_shape = shape.to_vec();
    out_shape[axis] = n_out;
    let mut output = vec![Complex64::new(0.0, 0.0); out_shape.iter().product()];

    // Fortran order: stride of `axis` is the product of preceding extents
    let stride: usize = shape[..axis].iter().product();
    let n_outer: usize = shape[axis + 1..].iter().product();
    let in_block = stride * n_in;
    let out_block = stride * n_out;

    for outer in 0..n_outer {
        for inner in 0..stride {
            let in_base = inner + outer * in_block;
            let out_base = inner + outer * out_block;
            line.fill(Complex64::new(0.0, 0.0));
            for j in 0..n_in {
                line[j] = input[in_base + j * stride] * in_phase[j];
            }
            fft.process_with_scratch(&mut line, &mut scratch);
            for j in 0..n_out {
                output[out_base + j * stride] = line[j] * out_phase[j];
            }
        }
    }

    Ok((output, out_shape))
}

/// Multi-dimensional Fourier transform composed from per-axis 1-D transforms
///
/// Axes are processed in the order given; axes not listed are untouched.
pub fn multi_dim_fourier_transform(
    input: &[Complex64],
    shape: &[usize],
    axes: &[usize],
    opts: &FtOptions,
    direction: TransformDirection,
) -> Result<(Vec<Complex64>, Vec<usize>)> {
    check_len(input.len(), shape)?;
    let ndim = shape.len();

    let mut current = input.to_vec();
    let mut current_shape = shape.to_vec();

    for &axis in axes {
        if axis >= ndim {
            return Err(ReconError::InvalidArgument(format!(
                "axis {} out of range for {}-dimensional array",
                axis, ndim
            )));
        }
        let n_in = current_shape[axis];
        let out_extent = axis_option(&opts.output_shape, axis, ndim)?.unwrap_or(n_in);
        let scale = axis_option(&opts.scale, axis, ndim)?.unwrap_or(1.0 / (n_in as f64).sqrt());
        let fft_extent = axis_option(&opts.fft_extent, axis, ndim)?.unwrap_or(0);
        let pre_shift = axis_option(&opts.pre_shift, axis, ndim)?.unwrap_or(-((n_in / 2) as f64));
        let post_shift =
            axis_option(&opts.post_shift, axis, ndim)?.unwrap_or((out_extent / 2) as f64);

        let (next, next_shape) = transform_axis(
            &current,
            &current_shape,
            axis,
            out_extent,
            scale,
            fft_extent,
            pre_shift,
            post_shift,
            direction,
        )?;
        current = next;
        current_shape = next_shape;
    }

    Ok((current, current_shape))
}

/// Fourier transform from image space to k-space along the given axes
pub fn transform_image_to_kspace(
    im: &[Complex64],
    shape: &[usize],
    axes: &[usize],
    opts: &FtOptions,
) -> Result<(Vec<Complex64>, Vec<usize>)> {
    multi_dim_fourier_transform(im, shape, axes, opts, TransformDirection::Forward)
}

/// Fourier transform from k-space to image space along the given axes
pub fn transform_kspace_to_image(
    kspace: &[Complex64],
    shape: &[usize],
    axes: &[usize],
    opts: &FtOptions,
) -> Result<(Vec<Complex64>, Vec<usize>)> {
    multi_dim_fourier_transform(kspace, shape, axes, opts, TransformDirection::Backward)
}

/// Reverse an array along one axis (out of place)
pub fn flip_dim(a: &[Complex64], shape: &[usize], axis: usize) -> Result<Vec<Complex64>> {
    check_len(a.len(), shape)?;
    if axis >= shape.len() {
        return Err(ReconError::InvalidArgument(format!(
            "axis {} out of range for {}-dimensional array",
            axis,
            shape.len()
        )));
    }
    let n = shape[axis];
    let stride: usize = shape[..axis].iter().product();
    let n_outer: usize = shape[axis + 1..].iter().product();
    let block = stride * n;

    let mut out = vec![Complex64::new(0.0, 0.0); a.len()];
    for outer in 0..n_outer {
        for j in 0..n {
            for inner in 0..stride {
                out[inner + (n - 1 - j) * stride + outer * block] =
                    a[inner + j * stride + outer * block];
            }
        }
    }
    Ok(out)
}

/// Transforms a k-space convolution kernel to image space for pixel-wise
/// multiplication
///
/// `kernel` has shape `[kx, ky, sourceNc, targetNc]`. The spatial axes
/// are flipped (a convolution kernel must be mirrored before image-domain
/// multiplicative use) and transformed with unit scale to the requested
/// image extent.
pub fn transform_kernel_to_image_space(
    kernel: &[Complex64],
    kernel_shape: &[usize],
    out_shape: (usize, usize),
) -> Result<Vec<Complex64>> {
    if kernel_shape.len() != 4 {
        return Err(ReconError::ShapeMismatch(format!(
            "kernel must be 4-dimensional [kx, ky, ncSource, ncTarget], got {:?}",
            kernel_shape
        )));
    }
    check_len(kernel.len(), kernel_shape)?;

    let flipped = flip_dim(kernel, kernel_shape, 0)?;
    let flipped = flip_dim(&flipped, kernel_shape, 1)?;

    let opts = FtOptions {
        output_shape: Some(vec![
            out_shape.0,
            out_shape.1,
            kernel_shape[2],
            kernel_shape[3],
        ]),
        scale: Some(vec![1.0, 1.0, 1.0, 1.0]),
        ..Default::default()
    };
    let (im_kernel, _) = transform_kspace_to_image(&flipped, kernel_shape, &[0, 1], &opts)?;
    Ok(im_kernel)
}
