//! Gaussian kernel generation.

use anyhow::{bail, Result};

/// Build a normalized `size`x`size` Gaussian kernel, row-major.
///
/// Entry at offset `(dx, dy)` from the center is `exp(-(dx^2 + dy^2) / (2*sigma^2))`,
/// and the whole matrix is divided by its sum so the entries total 1.
///
/// `size` must be odd and positive; the center is at `size / 2`.
pub fn gaussian_kernel(size: usize, sigma: f64) -> Result<Vec<f64>> {
    if size == 0 || size % 2 == 0 {
        bail!("kernel size must be odd and positive, got {}", size);
    }
    if sigma <= 0.0 {
        bail!("sigma must be positive, got {}", sigma);
    }

    let center = (size / 2) as isize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel = vec![0.0f64; size * size];
    let mut sum = 0.0;

    for ky in 0..size {
        for kx in 0..size {
            let dx = kx as isize - center;
            let dy = ky as isize - center;
            let value = (-((dx * dx + dy * dy) as f64) / denom).exp();
            kernel[ky * size + kx] = value;
            sum += value;
        }
    }

    for value in kernel.iter_mut() {
        *value /= sum;
    }

    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_sums_to_one() {
        for (size, sigma) in [(3, 2.0), (11, 2.0), (15, 3.5), (7, 0.8)] {
            let kernel = gaussian_kernel(size, sigma).unwrap();
            let sum: f64 = kernel.iter().sum();
            assert!(
                (sum - 1.0).abs() < 1e-9,
                "kernel {}x{} sigma {} sums to {}",
                size,
                size,
                sigma,
                sum
            );
        }
    }

    #[test]
    fn test_center_is_the_largest_entry() {
        let size = 15;
        let kernel = gaussian_kernel(size, 3.5).unwrap();
        let center = kernel[(size / 2) * size + size / 2];
        assert!(kernel.iter().all(|&v| v <= center));
    }

    #[test]
    fn test_kernel_is_symmetric() {
        let size = 11;
        let kernel = gaussian_kernel(size, 2.0).unwrap();
        for ky in 0..size {
            for kx in 0..size {
                let mirrored = kernel[(size - 1 - ky) * size + (size - 1 - kx)];
                assert!((kernel[ky * size + kx] - mirrored).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_even_or_zero_size_is_rejected() {
        assert!(gaussian_kernel(0, 2.0).is_err());
        assert!(gaussian_kernel(4, 2.0).is_err());
        assert!(gaussian_kernel(3, 0.0).is_err());
    }
}
