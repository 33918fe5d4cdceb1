//! Noise power estimators
//!
//! Three interchangeable strategies behind [`NoiseEstimator`]: residuals of the
//! pilot estimates against their neighbours, the residual of the PSS after
//! equalization, and the power on the empty subcarriers around PSS and SSS.

use crate::config::NoiseAlgorithm;
use crate::refsignal::re_index;
use crate::sync::pss::{pss_sequence, sync_first_subcarrier, PSS_LEN};
use common::types::{CellDescriptor, MAX_PORTS};
use common::utils::avg_power;
use num_complex::Complex32;
use tracing::trace;

/// Weight of the pilot itself in the neighbour average
const PILOT_WEIGHT: f32 = 1.0;

/// Empty subcarriers measured on each side of PSS and SSS
const EMPTY_GUARD: usize = 5;

/// Layout of the pilot estimates of one port in one subframe
#[derive(Debug, Clone, Copy)]
pub struct PilotLayout<'a> {
    pub nof_symbols: usize,
    pub pilots_per_symbol: usize,
    /// Subcarrier spacing between pilots of one symbol
    pub spacing: usize,
    /// Subcarrier of the first pilot of each symbol
    pub offsets: &'a [usize],
}

/// Everything a noise estimator may look at for one (antenna, port) pair
pub struct NoiseContext<'a> {
    pub cell: &'a CellDescriptor,
    pub sf_idx: usize,
    pub antenna: usize,
    pub port: usize,
    /// Raw least-squares pilot estimates
    pub pilots: &'a [Complex32],
    pub layout: PilotLayout<'a>,
    /// Received resource grid of this antenna
    pub grid: &'a [Complex32],
    /// Channel estimate of this (port, antenna) pair
    pub ce: &'a [Complex32],
}

/// Capability shared by the noise estimation strategies
pub trait NoiseEstimator {
    /// Noise power per resource element
    fn estimate_noise(&mut self, ctx: &NoiseContext<'_>) -> f32;
}

/// Residual of each pilot against the average of its neighbours
#[derive(Debug, Default, Clone)]
pub struct PilotDifference;

impl PilotDifference {
    /// Noise estimate from the pilot estimates alone
    pub fn estimate(pilots: &[Complex32], layout: &PilotLayout<'_>) -> f32 {
        if layout.nof_symbols >= 3 {
            time_frequency_residual(pilots, layout)
        } else {
            frequency_residual(pilots, layout)
        }
    }
}

impl NoiseEstimator for PilotDifference {
    fn estimate_noise(&mut self, ctx: &NoiseContext<'_>) -> f32 {
        Self::estimate(ctx.pilots, &ctx.layout)
    }
}

/// Pilots of symbol `l'` bracketing subcarrier `k`, as (index, count) pairs.
///
/// A co-located pilot is returned once with count 2. `None` when a bracket
/// falls outside the symbol.
fn bracket(k: usize, offset: usize, spacing: usize, len: usize) -> Option<[(usize, u32); 2]> {
    if k < offset {
        return None;
    }
    let below = (k - offset) / spacing;
    if (k - offset) % spacing == 0 {
        return (below < len).then_some([(below, 2), (below, 0)]);
    }
    (below + 1 < len).then_some([(below, 1), (below + 1, 1)])
}

/// Interior symbols against their two staggered time neighbours
fn time_frequency_residual(pilots: &[Complex32], layout: &PilotLayout<'_>) -> f32 {
    let n = layout.pilots_per_symbol;
    let mut acc = 0.0f32;
    let mut weight = 0.0f32;
    let mut count = 0usize;

    for l in 1..layout.nof_symbols - 1 {
        for i in 0..n {
            let k = layout.offsets[l] + layout.spacing * i;
            let before = bracket(k, layout.offsets[l - 1], layout.spacing, n);
            let after = bracket(k, layout.offsets[l + 1], layout.spacing, n);
            let (Some(before), Some(after)) = (before, after) else {
                continue;
            };

            let x = pilots[l * n + i];
            let mut sum = x * PILOT_WEIGHT;
            let mut sq = 0u32;
            for (row, pair) in [(l - 1, before), (l + 1, after)] {
                for (j, c) in pair {
                    sum += pilots[row * n + j] * c as f32;
                    sq += c * c;
                }
            }
            let total = PILOT_WEIGHT + 4.0;
            let residual = x - sum / total;
            acc += residual.norm_sqr();
            // Residual variance is (16 + sum c^2) / total^2 of the noise
            weight += (16.0 + sq as f32) / (total * total);
            count += 1;
        }
    }

    if count == 0 || weight <= 0.0 {
        return 0.0;
    }
    acc / weight
}

/// Pilots against their frequency neighbours, for ports with fewer than three pilot symbols
fn frequency_residual(pilots: &[Complex32], layout: &PilotLayout<'_>) -> f32 {
    let n = layout.pilots_per_symbol;
    if n < 3 {
        return 0.0;
    }
    let total = PILOT_WEIGHT + 2.0;
    let mut acc = 0.0f32;
    let mut count = 0usize;
    for l in 0..layout.nof_symbols {
        let row = &pilots[l * n..(l + 1) * n];
        for i in 1..n - 1 {
            let avg = (row[i - 1] + row[i] * PILOT_WEIGHT + row[i + 1]) / total;
            acc += (row[i] - avg).norm_sqr();
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    acc / count as f32 * total * total / 6.0
}

/// Estimates remembered from the last synchronization subframe
#[derive(Debug, Clone)]
struct LastEstimates {
    values: Vec<[Option<f32>; MAX_PORTS]>,
}

impl LastEstimates {
    fn new(nof_rx_antennas: usize) -> Self {
        Self {
            values: vec![[None; MAX_PORTS]; nof_rx_antennas],
        }
    }

    fn get(&self, antenna: usize, port: usize) -> Option<f32> {
        self.values.get(antenna).and_then(|v| v.get(port).copied().flatten())
    }

    fn set(&mut self, antenna: usize, port: usize, value: f32) {
        if let Some(slot) = self.values.get_mut(antenna).and_then(|v| v.get_mut(port)) {
            *slot = Some(value);
        }
    }

    fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = [None; MAX_PORTS]);
    }
}

fn is_sync_subframe(sf_idx: usize) -> bool {
    sf_idx == 0 || sf_idx == 5
}

/// Residual of the equalized PSS in subframes 0 and 5
#[derive(Debug, Clone)]
pub struct PssNoise {
    last: LastEstimates,
}

impl PssNoise {
    pub fn new(nof_rx_antennas: usize) -> Self {
        Self {
            last: LastEstimates::new(nof_rx_antennas),
        }
    }
}

impl NoiseEstimator for PssNoise {
    fn estimate_noise(&mut self, ctx: &NoiseContext<'_>) -> f32 {
        if !is_sync_subframe(ctx.sf_idx) {
            return self
                .last
                .get(ctx.antenna, ctx.port)
                .unwrap_or_else(|| PilotDifference::estimate(ctx.pilots, &ctx.layout));
        }

        let nof_prb = ctx.cell.nof_prb;
        let symbol = ctx.cell.cp.symbols_per_slot() - 1;
        let k0 = sync_first_subcarrier(nof_prb);
        let pss = pss_sequence(ctx.cell.pci.sector_id());

        let mut acc = 0.0f32;
        for (n, d) in pss.iter().enumerate() {
            let re = re_index(nof_prb, symbol, k0 + n);
            let (Some(h), Some(y)) = (ctx.ce.get(re), ctx.grid.get(re)) else {
                continue;
            };
            acc += (h * d - y).norm_sqr();
        }
        let noise = acc / PSS_LEN as f32;
        trace!("PSS noise {:.3e} (ant {} port {})", noise, ctx.antenna, ctx.port);
        self.last.set(ctx.antenna, ctx.port, noise);
        noise
    }
}

/// Power of the unused subcarriers next to PSS and SSS in subframes 0 and 5
#[derive(Debug, Clone)]
pub struct EmptySubcarrierNoise {
    last: LastEstimates,
}

impl EmptySubcarrierNoise {
    pub fn new(nof_rx_antennas: usize) -> Self {
        Self {
            last: LastEstimates::new(nof_rx_antennas),
        }
    }
}

impl NoiseEstimator for EmptySubcarrierNoise {
    fn estimate_noise(&mut self, ctx: &NoiseContext<'_>) -> f32 {
        if !is_sync_subframe(ctx.sf_idx) {
            return self
                .last
                .get(ctx.antenna, ctx.port)
                .unwrap_or_else(|| PilotDifference::estimate(ctx.pilots, &ctx.layout));
        }

        let nof_prb = ctx.cell.nof_prb;
        let nsymb = ctx.cell.cp.symbols_per_slot();
        let k0 = sync_first_subcarrier(nof_prb);
        let mut means = 0.0f32;
        for symbol in [nsymb - 2, nsymb - 1] {
            let row = re_index(nof_prb, symbol, 0);
            let lower = k0.saturating_sub(EMPTY_GUARD)..k0;
            let upper = k0 + PSS_LEN..k0 + PSS_LEN + EMPTY_GUARD;
            for band in [lower, upper] {
                if let Some(s) = ctx.grid.get(row + band.start..row + band.end) {
                    means += avg_power(s);
                }
            }
        }
        let noise = means / 4.0;
        trace!("Empty subcarrier noise {:.3e} (ant {} port {})", noise, ctx.antenna, ctx.port);
        self.last.set(ctx.antenna, ctx.port, noise);
        noise
    }
}

/// The three strategies, one selected per subframe by configuration
#[derive(Debug, Clone)]
pub struct NoiseEstimators {
    pilot_difference: PilotDifference,
    pss: PssNoise,
    empty: EmptySubcarrierNoise,
}

impl NoiseEstimators {
    pub fn new(nof_rx_antennas: usize) -> Self {
        Self {
            pilot_difference: PilotDifference,
            pss: PssNoise::new(nof_rx_antennas),
            empty: EmptySubcarrierNoise::new(nof_rx_antennas),
        }
    }

    pub fn select(&mut self, algorithm: NoiseAlgorithm) -> &mut dyn NoiseEstimator {
        match algorithm {
            NoiseAlgorithm::PilotDifference => &mut self.pilot_difference,
            NoiseAlgorithm::Pss => &mut self.pss,
            NoiseAlgorithm::EmptySubcarrier => &mut self.empty,
        }
    }

    /// Drop remembered estimates after a cell change
    pub fn clear(&mut self) {
        self.pss.last.clear();
        self.empty.last.clear();
    }
}
