//! pmri-core: parallel-MRI reconstruction algorithms
//!
//! This crate provides the numeric core of a parallel-imaging
//! reconstruction pipeline: coil calibration, k-space unaliasing and
//! channel combination. Arrays are dense flat buffers in Fortran
//! (column-major) order with the channel axis last.
//!
//! # Modules
//! - `fft`: shift-aware multi-dimensional Fourier transforms using rustfft
//! - `noise`: correlated noise synthesis, covariance estimation, prewhitening
//! - `combine`: channel combination maps, RSS, shading normalization
//! - `csm`: coil sensitivity estimation (McKenzie, Walsh eigenvector method)
//! - `cal`: sampling patterns and calibration-region extraction
//! - `jer`: joint encoding relation lookup tables (model and data driven)
//! - `unmix`: SENSE and JER/GRAPPA-style unmixing solvers
//! - `dvc`: data-driven virtual coil phase-sensitive combination
//! - `quality`: g-factor and aliasing energy maps
//! - `linalg`: small dense complex solvers shared by the above
//! - `viz`: diagnostic sink trait for intermediate images

// Core modules
pub mod error;
pub mod fft;
pub mod linalg;

// Pipeline stages
pub mod cal;
pub mod combine;
pub mod csm;
pub mod dvc;
pub mod jer;
pub mod noise;
pub mod quality;
pub mod unmix;

// External interfaces
pub mod viz;

pub use error::{ReconError, Result};
