//! Pilot smoothing filters
//!
//! Symmetric FIR taps for frequency-domain smoothing of the per-symbol pilot
//! estimates, and the time-domain merging used by the averaging estimator.

use num_complex::Complex32;

/// Gaussian taps of length `order + 1` with standard deviation `std_dev` (in pilots).
///
/// A vanishing or non-finite deviation degenerates to a delta filter.
pub fn gauss_filter(order: usize, std_dev: f32, taps: &mut Vec<f32>) {
    let len = order + 1;
    let center = (len - 1) / 2;
    taps.clear();
    taps.resize(len, 0.0);

    if !std_dev.is_finite() || std_dev < 1e-6 {
        taps[center] = 1.0;
        return;
    }

    let two_var = 2.0 * std_dev * std_dev;
    for (i, t) in taps.iter_mut().enumerate() {
        let d = i as f32 - center as f32;
        *t = (-d * d / two_var).exp();
    }
    normalize(taps);
}

/// Triangular taps `1, 2, .., k+1, .., 2, 1` of odd width at least 3
pub fn triangle_filter(width: usize, taps: &mut Vec<f32>) {
    let width = if width < 3 { 3 } else { width | 1 };
    let k = width / 2;
    taps.clear();
    taps.extend((0..width).map(|i| (k + 1 - i.abs_diff(k)) as f32));
    normalize(taps);
}

fn normalize(taps: &mut [f32]) {
    let sum: f32 = taps.iter().sum();
    if sum > 0.0 {
        taps.iter_mut().for_each(|t| *t /= sum);
    }
}

/// Pilot row produced by [`merge_rows`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedRow {
    pub len: usize,
    /// Subcarrier of the first pilot
    pub offset: usize,
    pub spacing: usize,
}

/// Average the pilot rows of one subframe over time into `out`.
///
/// Rows sharing a subcarrier offset are averaged together. When the rows use
/// two offsets half a spacing apart the two averages are interleaved into one
/// row of twice the density, so every merged pilot keeps its true subcarrier.
/// Rows on any other offset are left out.
pub fn merge_rows(
    pilots: &[Complex32],
    row_len: usize,
    offsets: &[usize],
    spacing: usize,
    out: &mut [Complex32],
) -> MergedRow {
    let lo = offsets.iter().copied().min().unwrap_or(0);
    let hi = offsets.iter().copied().max().unwrap_or(0);
    let interleave = hi != lo && spacing % 2 == 0 && hi - lo == spacing / 2;
    let stride = if interleave { 2 } else { 1 };
    let len = row_len * stride;

    out[..len].fill(Complex32::new(0.0, 0.0));
    let mut counts = [0u32; 2];
    for (l, &off) in offsets.iter().enumerate() {
        let phase = if off == lo {
            0
        } else if interleave {
            1
        } else {
            continue;
        };
        counts[phase] += 1;
        for (i, &x) in pilots[l * row_len..(l + 1) * row_len].iter().enumerate() {
            out[i * stride + phase] += x;
        }
    }
    for (i, v) in out[..len].iter_mut().enumerate() {
        let c = counts[i % stride];
        if c > 0 {
            *v /= c as f32;
        }
    }

    MergedRow {
        len,
        offset: lo,
        spacing: spacing / stride,
    }
}
