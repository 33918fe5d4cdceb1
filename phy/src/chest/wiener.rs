//! Adaptive frequency-domain Wiener interpolation of pilot estimates
//!
//! Each (port, antenna, pilot symbol) keeps a running estimate of the pilot
//! autocorrelation at lags 0 and one pilot spacing. Once enough subframes have
//! been seen, the channel frequency correlation is modelled by an exponential
//! power delay profile and every subcarrier is estimated from its four nearest
//! pilots with LMMSE weights.

use num_complex::{Complex32, Complex64};
use std::f64::consts::PI;
use tracing::debug;

/// Subframes observed before the filter is used
pub const WIENER_READY_UPDATES: u32 = 8;

/// Smoothing factor of the correlation estimates
const WIENER_EMA_ALPHA: f32 = 0.25;

/// Pilots combined per output subcarrier
const WINDOW: usize = 4;

/// Lower bound of the noise-to-signal regularization
const MIN_NSR: f64 = 1e-4;

/// Correlation state of one pilot symbol stream
#[derive(Debug, Clone, Copy, Default)]
struct WienerState {
    shift: usize,
    r0: f32,
    r1: Complex32,
    updates: u32,
}

impl WienerState {
    fn update(&mut self, pilots: &[Complex32], shift: usize) {
        if self.shift != shift {
            *self = Self {
                shift,
                ..Self::default()
            };
        }
        let n = pilots.len();
        if n < 2 {
            return;
        }
        let r0 = pilots.iter().map(|p| p.norm_sqr()).sum::<f32>() / n as f32;
        let r1 = pilots.windows(2).map(|w| w[1] * w[0].conj()).sum::<Complex32>() / (n - 1) as f32;

        if self.updates == 0 {
            self.r0 = r0;
            self.r1 = r1;
        } else {
            self.r0 = WIENER_EMA_ALPHA * r0 + (1.0 - WIENER_EMA_ALPHA) * self.r0;
            self.r1 = r1 * WIENER_EMA_ALPHA + self.r1 * (1.0 - WIENER_EMA_ALPHA);
        }
        self.updates = self.updates.saturating_add(1);
    }

    fn ready(&self) -> bool {
        self.updates >= WIENER_READY_UPDATES
    }

    /// Normalized delay spread from the lag-one correlation, in cycles per subcarrier
    fn delay(&self, spacing: usize) -> f64 {
        if self.r0 <= 0.0 {
            return 0.0;
        }
        let rho = Complex64::new(self.r1.re as f64, self.r1.im as f64) / self.r0 as f64;
        if rho.norm() < 1e-9 {
            return 0.0;
        }
        let x = rho.inv() - 1.0;
        let delay = x.im / (2.0 * PI * spacing as f64);
        if delay.is_finite() {
            delay
        } else {
            0.0
        }
    }
}

/// Frequency correlation at a distance of `delta` subcarriers
fn correlation(delta: f64, delay: f64) -> Complex64 {
    Complex64::new(1.0, 2.0 * PI * delta * delay).inv()
}

/// Bank of Wiener states for all (port, antenna, pilot symbol) streams
#[derive(Debug, Clone)]
pub struct WienerFilter {
    nof_rx_antennas: usize,
    max_symbols: usize,
    states: Vec<WienerState>,
}

impl WienerFilter {
    pub fn new(nof_ports: usize, nof_rx_antennas: usize, max_symbols: usize) -> Self {
        Self {
            nof_rx_antennas,
            max_symbols,
            states: vec![WienerState::default(); nof_ports * nof_rx_antennas * max_symbols],
        }
    }

    fn index(&self, port: usize, antenna: usize, symbol: usize) -> usize {
        (port * self.nof_rx_antennas + antenna) * self.max_symbols + symbol
    }

    /// Fold the raw pilots of one symbol into its state
    pub fn update(&mut self, port: usize, antenna: usize, symbol: usize, shift: usize, pilots: &[Complex32]) {
        let idx = self.index(port, antenna, symbol);
        if let Some(state) = self.states.get_mut(idx) {
            state.update(pilots, shift);
        }
    }

    /// Whether the stream has converged for the current pilot shift
    pub fn ready(&self, port: usize, antenna: usize, symbol: usize, shift: usize) -> bool {
        self.states
            .get(self.index(port, antenna, symbol))
            .is_some_and(|s| s.shift == shift && s.ready())
    }

    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(|s| *s = WienerState::default());
        debug!("Wiener filter state cleared");
    }

    /// Estimate every subcarrier of one symbol from its pilots.
    ///
    /// Pilot `i` sits on subcarrier `offset + spacing * i`; `snr` is the linear
    /// signal-to-noise ratio used for regularization.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        port: usize,
        antenna: usize,
        symbol: usize,
        pilots: &[Complex32],
        offset: usize,
        spacing: usize,
        snr: f32,
        output: &mut [Complex32],
    ) {
        let n = pilots.len();
        if n < WINDOW {
            return;
        }
        let delay = self
            .states
            .get(self.index(port, antenna, symbol))
            .map_or(0.0, |s| s.delay(spacing));
        let nsr = if snr.is_finite() && snr > 0.0 {
            (1.0 / snr as f64).max(MIN_NSR)
        } else {
            MIN_NSR
        };

        // Pilot-to-pilot correlation only depends on the index distance
        let mut r_pp = [[Complex64::new(0.0, 0.0); WINDOW]; WINDOW];
        for (a, row) in r_pp.iter_mut().enumerate() {
            for (b, v) in row.iter_mut().enumerate() {
                *v = correlation(spacing as f64 * (a as f64 - b as f64), delay);
                if a == b {
                    *v += nsr;
                }
            }
        }

        for (k, out) in output.iter_mut().enumerate() {
            let below = if k > offset { (k - offset) / spacing } else { 0 };
            let start = below.saturating_sub(WINDOW / 2 - 1).min(n - WINDOW);

            let mut rhs = [Complex64::new(0.0, 0.0); WINDOW];
            for (a, r) in rhs.iter_mut().enumerate() {
                let pos = (offset + spacing * (start + a)) as f64;
                *r = correlation(k as f64 - pos, delay).conj();
            }

            let mut m = r_pp;
            let w = solve(&mut m, &mut rhs);
            *out = w
                .iter()
                .zip(&pilots[start..start + WINDOW])
                .map(|(w, x)| {
                    let c = w.conj();
                    Complex32::new(c.re as f32, c.im as f32) * x
                })
                .sum();
        }
    }
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting
fn solve(a: &mut [[Complex64; WINDOW]; WINDOW], b: &mut [Complex64; WINDOW]) -> [Complex64; WINDOW] {
    for col in 0..WINDOW {
        let mut max_row = col;
        let mut max_val = a[col][col].norm();
        for row in (col + 1)..WINDOW {
            if a[row][col].norm() > max_val {
                max_val = a[row][col].norm();
                max_row = row;
            }
        }
        a.swap(col, max_row);
        b.swap(col, max_row);

        let pivot = a[col][col];
        if pivot.norm() < 1e-30 {
            continue;
        }
        for row in (col + 1)..WINDOW {
            let factor = a[row][col] / pivot;
            for k in col..WINDOW {
                let v = a[col][k];
                a[row][k] -= factor * v;
            }
            let v = b[col];
            b[row] -= factor * v;
        }
    }

    let mut x = [Complex64::new(0.0, 0.0); WINDOW];
    for i in (0..WINDOW).rev() {
        let mut sum = b[i];
        for j in (i + 1)..WINDOW {
            sum -= a[i][j] * x[j];
        }
        x[i] = if a[i][i].norm() < 1e-30 {
            Complex64::new(0.0, 0.0)
        } else {
            sum / a[i][i]
        };
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_identity_and_general() {
        let one = Complex64::new(1.0, 0.0);
        let zero = Complex64::new(0.0, 0.0);
        let mut a = [[zero; WINDOW]; WINDOW];
        for (i, row) in a.iter_mut().enumerate() {
            row[i] = one * (i as f64 + 1.0);
        }
        a[0][3] = Complex64::new(0.0, 1.0);
        let x_true = [one, Complex64::new(0.5, -1.0), zero, Complex64::new(2.0, 0.0)];
        let mut b = [zero; WINDOW];
        for i in 0..WINDOW {
            for j in 0..WINDOW {
                b[i] += a[i][j] * x_true[j];
            }
        }
        let x = solve(&mut a, &mut b);
        for (u, v) in x.iter().zip(x_true.iter()) {
            assert!((u - v).norm() < 1e-9);
        }
    }

    #[test]
    fn test_ready_after_updates() {
        let mut wf = WienerFilter::new(1, 1, 4);
        let pilots = vec![Complex32::new(1.0, 0.0); 12];
        for _ in 0..WIENER_READY_UPDATES - 1 {
            wf.update(0, 0, 1, 3, &pilots);
        }
        assert!(!wf.ready(0, 0, 1, 3));
        wf.update(0, 0, 1, 3, &pilots);
        assert!(wf.ready(0, 0, 1, 3));
        assert!(!wf.ready(0, 0, 1, 0));
        assert!(!wf.ready(0, 0, 0, 3));

        // A different shift restarts convergence
        wf.update(0, 0, 1, 0, &pilots);
        assert!(!wf.ready(0, 0, 1, 3));
        wf.reset();
        assert!(!wf.ready(0, 0, 1, 0));
    }

    #[test]
    fn test_flat_channel_is_reproduced() {
        let mut wf = WienerFilter::new(1, 1, 4);
        let h = Complex32::new(0.6, -0.3);
        let pilots = vec![h; 12];
        for _ in 0..WIENER_READY_UPDATES {
            wf.update(0, 0, 0, 2, &pilots);
        }
        let mut out = vec![Complex32::new(0.0, 0.0); 72];
        wf.run(0, 0, 0, &pilots, 2, 6, 1e6, &mut out);
        for v in &out {
            assert!((v - h).norm() < 1e-3, "{}", v);
        }
    }

    #[test]
    fn test_linear_phase_channel_tracked() {
        // Pure delay of 0.2 samples in a 128-point FFT
        let slope = -2.0 * std::f32::consts::PI * 0.2 / 128.0;
        let h = |k: usize| Complex32::from_polar(1.0, slope * k as f32);
        let pilots: Vec<Complex32> = (0..12).map(|i| h(1 + 6 * i)).collect();
        let mut wf = WienerFilter::new(1, 1, 4);
        for _ in 0..WIENER_READY_UPDATES {
            wf.update(0, 0, 0, 1, &pilots);
        }
        let mut out = vec![Complex32::new(0.0, 0.0); 72];
        wf.run(0, 0, 0, &pilots, 1, 6, 100.0, &mut out);
        for (k, v) in out.iter().enumerate().skip(2).take(64) {
            assert!((v - h(k)).norm() < 0.05, "k={} {} vs {}", k, v, h(k));
        }
    }
}
