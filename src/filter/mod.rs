//! # Gaussian Filter Pipeline
//!
//! The deterministic pixel transform run on every worker: kernel generation,
//! mirror-boundary convolution over 24-bit BGR buffers, and the light/heavy
//! pipeline compositions.

pub mod convolve;
pub mod kernel;
pub mod pipeline;

pub use convolve::{convolve, BgrImage, Boundary};
pub use kernel::gaussian_kernel;
pub use pipeline::{process_image, FilterMode};
