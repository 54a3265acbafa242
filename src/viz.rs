//! Diagnostic display hook
//!
//! The reconstruction core never renders anything itself. Long pipelines
//! (the DVC driver in particular) can hand intermediate images to a
//! [`DiagnosticSink`] supplied by the caller; the call is fire-and-forget
//! and never gates computation.

use num_complex::Complex64;

/// Receiver for intermediate diagnostic images
pub trait DiagnosticSink {
    /// Display or record an image. `image` is `[nx, ny]` in Fortran order.
    fn show(&self, title: &str, image: &[Complex64], nx: usize, ny: usize);
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn show(&self, _title: &str, _image: &[Complex64], _nx: usize, _ny: usize) {}
}
