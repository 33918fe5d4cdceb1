//! Vector Interpolation Primitives
//!
//! Piecewise-linear expansion of pilot sequences in frequency and time, and the
//! edge-extrapolating convolution used to smooth pilot estimates.

use crate::PhyError;
use num_complex::Complex32;

/// Linear interpolator expanding `vector_len` samples by a factor `m`
#[derive(Debug, Clone)]
pub struct LinearInterpolator {
    vector_len: usize,
    m: usize,
    max_vector_len: usize,
}

impl LinearInterpolator {
    /// Create an interpolator able to handle up to `max_vector_len` input samples
    pub fn new(max_vector_len: usize, m: usize) -> Result<Self, PhyError> {
        if m == 0 || max_vector_len == 0 {
            return Err(PhyError::ConfigurationError(format!(
                "Invalid interpolator dimensions: len={}, M={}",
                max_vector_len, m
            )));
        }
        Ok(Self {
            vector_len: max_vector_len,
            m,
            max_vector_len,
        })
    }

    /// Change the input length, never beyond the initial allocation
    pub fn resize(&mut self, vector_len: usize) -> Result<(), PhyError> {
        if vector_len > self.max_vector_len {
            return Err(PhyError::CapacityExceeded {
                what: "interpolator length",
                requested: vector_len,
                capacity: self.max_vector_len,
            });
        }
        self.vector_len = vector_len;
        Ok(())
    }

    /// Current input length
    pub fn vector_len(&self) -> usize {
        self.vector_len
    }

    /// Interpolation ratio
    pub fn ratio(&self) -> usize {
        self.m
    }

    /// Expand `input` into `output` placing input sample `i` at `off_st + i * M`.
    ///
    /// The `off_st` samples before the first input and the `off_end` samples
    /// from the last input onwards are extrapolated from the nearest slope.
    /// `output` must hold `off_st + (len - 1) * M + off_end` samples.
    pub fn run_offset(&self, input: &[Complex32], output: &mut [Complex32], off_st: usize, off_end: usize) {
        let len = self.vector_len.min(input.len());
        if len == 0 {
            return;
        }
        let m = self.m as f32;
        let total = (off_st + (len - 1) * self.m + off_end).min(output.len());

        if len == 1 {
            output[..total].fill(input[0]);
            return;
        }

        let first_slope = (input[1] - input[0]) / m;
        for j in 0..off_st {
            let idx = off_st - j - 1;
            if idx < total {
                output[idx] = input[0] - first_slope * (j + 1) as f32;
            }
        }

        for i in 0..len - 1 {
            let diff = (input[i + 1] - input[i]) / m;
            for j in 0..self.m {
                let idx = off_st + i * self.m + j;
                if idx < total {
                    output[idx] = input[i] + diff * j as f32;
                }
            }
        }

        let last_slope = (input[len - 1] - input[len - 2]) / m;
        for j in 0..off_end {
            let idx = off_st + (len - 1) * self.m + j;
            if idx < total {
                output[idx] = input[len - 1] + last_slope * j as f32;
            }
        }
    }
}

/// Write `a + t * (b - a)` into `out`; `t` outside [0, 1] extrapolates
pub fn interp_linear_vector(a: &[Complex32], b: &[Complex32], t: f32, out: &mut [Complex32]) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x + (y - x) * t;
    }
}

/// Convolve `input` with the symmetric `filter`, keeping the input length.
///
/// Samples beyond both ends are linearly extrapolated from the two outermost
/// inputs so that a linear ramp passes through unchanged.
pub fn conv_same(input: &[Complex32], filter: &[f32], output: &mut [Complex32]) {
    let n = input.len().min(output.len());
    if n == 0 || filter.is_empty() {
        return;
    }
    let half = (filter.len() / 2) as isize;

    let sample = |p: isize| -> Complex32 {
        if n == 1 {
            input[0]
        } else if p < 0 {
            input[0] + (input[1] - input[0]) * p as f32
        } else if p >= n as isize {
            input[n - 1] + (input[n - 1] - input[n - 2]) * (p - n as isize + 1) as f32
        } else {
            input[p as usize]
        }
    };

    for (i, out) in output.iter_mut().enumerate().take(n) {
        *out = filter
            .iter()
            .enumerate()
            .map(|(j, &w)| sample(i as isize + j as isize - half) * w)
            .sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<Complex32> {
        (0..len).map(|i| Complex32::new(i as f32, -(i as f32) * 0.5)).collect()
    }

    #[test]
    fn test_linear_offset_reproduces_ramp() {
        // Pilots at 2, 8, 14, 20 of a ramp with unit slope per subcarrier
        let pilots: Vec<Complex32> = (0..4).map(|i| Complex32::new((2 + 6 * i) as f32, 0.0)).collect();
        let interp = LinearInterpolator::new(4, 6).unwrap();
        let mut out = vec![Complex32::new(0.0, 0.0); 24];
        interp.run_offset(&pilots, &mut out, 2, 4);
        for (k, v) in out.iter().enumerate() {
            assert!((v.re - k as f32).abs() < 1e-4, "k={} v={}", k, v);
        }
    }

    #[test]
    fn test_linear_offset_single_input() {
        let interp = LinearInterpolator::new(1, 6).unwrap();
        let mut out = vec![Complex32::new(0.0, 0.0); 6];
        interp.run_offset(&[Complex32::new(2.0, 1.0)], &mut out, 3, 3);
        assert!(out.iter().all(|v| *v == Complex32::new(2.0, 1.0)));
    }

    #[test]
    fn test_linear_offset_short_output_is_truncated() {
        let pilots: Vec<Complex32> = (0..4).map(|i| Complex32::new((5 + 6 * i) as f32, 0.0)).collect();
        let interp = LinearInterpolator::new(4, 6).unwrap();
        // Shorter than the leading offset
        let mut out = vec![Complex32::new(0.0, 0.0); 3];
        interp.run_offset(&pilots, &mut out, 5, 1);
        for (k, v) in out.iter().enumerate() {
            assert!((v.re - k as f32).abs() < 1e-4, "k={} v={}", k, v);
        }
        interp.run_offset(&pilots, &mut [], 5, 1);
    }

    #[test]
    fn test_resize_beyond_capacity_fails() {
        let mut interp = LinearInterpolator::new(8, 6).unwrap();
        assert!(interp.resize(4).is_ok());
        assert_eq!(interp.vector_len(), 4);
        assert!(matches!(interp.resize(9), Err(PhyError::CapacityExceeded { .. })));
        assert!(LinearInterpolator::new(8, 0).is_err());
    }

    #[test]
    fn test_interp_linear_vector_extrapolates() {
        let a = vec![Complex32::new(1.0, 0.0); 3];
        let b = vec![Complex32::new(3.0, 0.0); 3];
        let mut out = vec![Complex32::new(0.0, 0.0); 3];
        interp_linear_vector(&a, &b, 0.5, &mut out);
        assert!((out[0].re - 2.0).abs() < 1e-6);
        interp_linear_vector(&a, &b, 1.5, &mut out);
        assert!((out[2].re - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_conv_same_preserves_ramp() {
        let input = ramp(10);
        let filter = [0.25, 0.5, 0.25];
        let mut out = vec![Complex32::new(0.0, 0.0); 10];
        conv_same(&input, &filter, &mut out);
        for (a, b) in input.iter().zip(&out) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn test_conv_same_smooths_impulse() {
        let mut input = vec![Complex32::new(0.0, 0.0); 9];
        input[4] = Complex32::new(1.0, 0.0);
        let filter = [0.25, 0.5, 0.25];
        let mut out = vec![Complex32::new(0.0, 0.0); 9];
        conv_same(&input, &filter, &mut out);
        assert!((out[3].re - 0.25).abs() < 1e-6);
        assert!((out[4].re - 0.5).abs() < 1e-6);
        assert!((out[5].re - 0.25).abs() < 1e-6);
        assert_eq!(out[0], Complex32::new(0.0, 0.0));
    }
}
