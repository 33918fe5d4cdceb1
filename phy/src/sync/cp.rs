//! Cyclic Prefix Correlator
//!
//! Correlates each cyclic prefix with the tail of its OFDM symbol. The offset
//! of the strongest correlation gives symbol timing and its phase gives the
//! fractional carrier frequency offset.

use crate::PhyError;
use common::utils::dot_prod_conj;
use num_complex::Complex32;
use std::f32::consts::PI;
use tracing::{trace, warn};

/// Windowed CP autocorrelation over consecutive OFDM symbols
#[derive(Debug, Clone)]
pub struct CpCorrelator {
    symbol_sz: usize,
    max_symbol_sz: usize,
    corr: Vec<Complex32>,
}

impl CpCorrelator {
    /// Allocate for symbols of up to `symbol_sz` samples
    pub fn new(symbol_sz: usize) -> Result<Self, PhyError> {
        if symbol_sz == 0 {
            return Err(PhyError::ConfigurationError("CP correlator needs a non-zero symbol size".to_string()));
        }
        Ok(Self {
            symbol_sz,
            max_symbol_sz: symbol_sz,
            corr: vec![Complex32::new(0.0, 0.0); symbol_sz],
        })
    }

    /// Change the symbol size without reallocating
    pub fn resize(&mut self, symbol_sz: usize) -> Result<(), PhyError> {
        if symbol_sz > self.max_symbol_sz {
            warn!(
                "Rejecting CP correlator resize to {} (allocated {})",
                symbol_sz, self.max_symbol_sz
            );
            return Err(PhyError::CapacityExceeded {
                what: "CP correlator symbol size",
                requested: symbol_sz,
                capacity: self.max_symbol_sz,
            });
        }
        self.symbol_sz = symbol_sz;
        Ok(())
    }

    pub fn symbol_sz(&self) -> usize {
        self.symbol_sz
    }

    /// Average CP correlation for every offset in `[0, max_offset)` over
    /// `nof_symbols` symbols, returning the offset of largest magnitude.
    ///
    /// Every seventh symbol (the first of a normal-CP slot) uses `cp_len + 1`.
    /// `max_offset` is clamped to the symbol size. Terms that would read past
    /// the end of `input` are left out.
    pub fn correlate(&mut self, input: &[Complex32], max_offset: usize, nof_symbols: usize, cp_len: usize) -> usize {
        let n = self.symbol_sz;
        let max_offset = max_offset.min(n);
        if nof_symbols == 0 || max_offset == 0 {
            return 0;
        }

        let scale = 1.0 / nof_symbols as f32;
        for i in 0..max_offset {
            let mut acc = Complex32::new(0.0, 0.0);
            let mut start = 0;
            for s in 0..nof_symbols {
                let cplen = if s % 7 == 0 { cp_len + 1 } else { cp_len };
                let head = start + i;
                if head + n + cplen > input.len() {
                    break;
                }
                acc += dot_prod_conj(&input[head..head + cplen], &input[head + n..head + n + cplen]) * scale;
                start += n + cplen;
            }
            self.corr[i] = acc;
        }

        let (max_idx, _) = self.corr[..max_offset]
            .iter()
            .enumerate()
            .fold((0, -1.0f32), |best, (i, c)| {
                let mag = c.norm_sqr();
                if mag > best.1 {
                    (i, mag)
                } else {
                    best
                }
            });

        trace!("CP correlation peak at {} of {}", max_idx, max_offset);
        max_idx
    }

    /// Correlation value of the last run at `offset`
    pub fn corr_output(&self, offset: usize) -> Complex32 {
        self.corr
            .get(offset.min(self.symbol_sz.saturating_sub(1)))
            .copied()
            .unwrap_or_default()
    }

    /// Fractional CFO in subcarriers implied by the correlation at `offset`
    pub fn cfo(&self, offset: usize) -> f32 {
        -self.corr_output(offset).arg() / (2.0 * PI)
    }
}
