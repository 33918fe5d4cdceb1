//! Common Utilities
//!
//! Numeric helpers shared by the synchronizer and the channel estimator

use num_complex::Complex32;
use tracing::trace;

use crate::types::MAX_PRB;

/// Convert a linear power ratio to dB
pub fn power_to_db(power: f32) -> f32 {
    10.0 * power.log10()
}

/// Convert a linear power (W) to dBm
pub fn power_to_dbm(power: f32) -> f32 {
    power_to_db(power) + 30.0
}

/// Average power of a complex vector, zero for an empty vector
pub fn avg_power(x: &[Complex32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().map(|v| v.norm_sqr()).sum::<f32>() / x.len() as f32
}

/// Sum of `a[i] * conj(b[i])`
pub fn dot_prod_conj(a: &[Complex32], b: &[Complex32]) -> Complex32 {
    a.iter().zip(b).map(|(x, y)| x * y.conj()).sum()
}

/// Round up to next power of 2
pub fn next_power_of_2(n: u32) -> u32 {
    if n == 0 {
        return 1;
    }

    let mut v = n;
    v -= 1;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v + 1
}

/// FFT size needed to demodulate a carrier of `nof_prb` resource blocks
pub fn symbol_size(nof_prb: u32) -> Option<usize> {
    let size = match nof_prb {
        0 => return None,
        1..=6 => 128,
        7..=15 => 256,
        16..=25 => 512,
        26..=50 => 1024,
        51..=75 => 1536,
        76..=MAX_PRB => 2048,
        _ => return None,
    };

    trace!("FFT size {} for {} PRB", size, nof_prb);

    Some(size)
}

/// Multiply `x` in place by `exp(j*2*pi*freq*n)`, `freq` in cycles per sample
pub fn apply_frequency_shift(x: &mut [Complex32], freq: f32) {
    let step = 2.0 * std::f64::consts::PI * freq as f64;
    for (n, sample) in x.iter_mut().enumerate() {
        // f64 phase keeps long buffers from drifting
        let phase = (step * n as f64).rem_euclid(2.0 * std::f64::consts::PI);
        *sample *= Complex32::from_polar(1.0, phase as f32);
    }
}
