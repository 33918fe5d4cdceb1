//! Downlink Reference Signal Generation
//!
//! Cell-specific reference signals (CRS) and MBSFN area reference signals
//! according to 3GPP TS 36.211 Section 6.10. Pilot tables are computed once per
//! cell identity and then used both to place pilots in a transmit grid and as the
//! known reference during channel estimation.

use crate::PhyError;
use common::types::{CellDescriptor, CyclicPrefix, Pci, MAX_PRB, NOF_SLOTS, NOF_SUBFRAMES, NRE};
use ndarray::{s, Array2, Array3, ArrayView1};
use num_complex::Complex32;
use std::f32::consts::FRAC_1_SQRT_2;
use tracing::{debug, info};

/// Antenna port carrying MBSFN reference signals
pub const MBSFN_PORT: usize = 4;

/// Symbols per subframe in the MBSFN region (extended CP numerology)
pub const MBSFN_SYMBOLS_PER_SUBFRAME: usize = 12;

/// Maximum number of CRS-bearing symbols per subframe for one port
const MAX_CRS_SYMBOLS: usize = 4;

/// Number of MBSFN-bearing symbols per subframe
const MBSFN_SYMBOLS: usize = 3;

/// OFDM symbols (within the subframe) carrying MBSFN pilots
const MBSFN_SYMBOL_IDX: [usize; MBSFN_SYMBOLS] = [2, 6, 10];

/// Number of CRS-bearing symbols per subframe for `port`
pub fn nof_symbols(port: usize) -> usize {
    if port < 2 {
        4
    } else {
        2
    }
}

/// CRS pilots in one symbol
pub fn nof_pilots_per_symbol(nof_prb: u32) -> usize {
    2 * nof_prb as usize
}

/// CRS pilots in one subframe for `port`
pub fn nof_pilots(port: usize, nof_prb: u32) -> usize {
    nof_symbols(port) * nof_pilots_per_symbol(nof_prb)
}

/// Subframe symbol index of the `l`-th CRS-bearing symbol of `port`
pub fn symbol_index(port: usize, l: usize, cp: CyclicPrefix) -> usize {
    let nsymb = cp.symbols_per_slot();
    if port < 2 {
        if l % 2 == 1 {
            (l / 2 + 1) * nsymb - 3
        } else {
            (l / 2) * nsymb
        }
    } else {
        1 + l * nsymb
    }
}

/// Subcarrier of the first pilot in the `l`-th CRS-bearing symbol of `port`
pub fn frequency_offset(port: usize, l: usize, pci: Pci) -> usize {
    let v = match port {
        0 => {
            if l % 2 == 0 {
                0
            } else {
                3
            }
        }
        1 => {
            if l % 2 == 0 {
                3
            } else {
                0
            }
        }
        2 => {
            if l == 0 {
                0
            } else {
                3
            }
        }
        _ => {
            if l == 0 {
                3
            } else {
                6
            }
        }
    };
    (v + pci.pilot_shift()) % 6
}

/// Position of pilot `i` of symbol `l` inside a per-port pilot vector
pub fn pilot_index(i: usize, l: usize, nof_prb: u32) -> usize {
    nof_pilots_per_symbol(nof_prb) * l + i
}

/// Position of subcarrier `k` of symbol `symbol` inside a subframe grid
pub fn re_index(nof_prb: u32, symbol: usize, k: usize) -> usize {
    symbol * nof_prb as usize * NRE + k
}

/// MBSFN pilots in one symbol
pub fn mbsfn_nof_pilots_per_symbol(nof_prb: u32) -> usize {
    6 * nof_prb as usize
}

/// MBSFN pilots in one subframe
pub fn mbsfn_nof_pilots(nof_prb: u32) -> usize {
    MBSFN_SYMBOLS * mbsfn_nof_pilots_per_symbol(nof_prb)
}

/// Number of MBSFN-bearing symbols per subframe
pub fn mbsfn_nof_symbols() -> usize {
    MBSFN_SYMBOLS
}

/// Subframe symbol index of the `l`-th MBSFN-bearing symbol
pub fn mbsfn_symbol_index(l: usize) -> usize {
    MBSFN_SYMBOL_IDX[l % MBSFN_SYMBOLS]
}

/// Subcarrier of the first MBSFN pilot in symbol `l`; pilots then repeat every 2
pub fn mbsfn_frequency_offset(l: usize) -> usize {
    l % 2
}

/// Warm-up length of the pseudo-random generator
const GOLD_NC: usize = 1600;

/// Bits `c(n)` of the length-31 Gold sequence of TS 36.211 7.2
#[derive(Debug, Clone)]
struct GoldBits {
    /// Bit `i` holds `x1(n + i)`
    x1: u32,
    /// Bit `i` holds `x2(n + i)`
    x2: u32,
}

impl GoldBits {
    fn new(c_init: u32) -> Self {
        let mut bits = Self {
            x1: 1,
            x2: c_init & 0x7FFF_FFFF,
        };
        for _ in 0..GOLD_NC {
            bits.step();
        }
        bits
    }

    fn step(&mut self) -> bool {
        let out = (self.x1 ^ self.x2) & 1 == 1;
        let f1 = (self.x1 ^ (self.x1 >> 3)) & 1;
        let f2 = (self.x2 ^ (self.x2 >> 1) ^ (self.x2 >> 2) ^ (self.x2 >> 3)) & 1;
        self.x1 = (self.x1 >> 1) | (f1 << 30);
        self.x2 = (self.x2 >> 1) | (f2 << 30);
        out
    }
}

impl Iterator for GoldBits {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        Some(self.step())
    }
}

/// Fill `out` with the QPSK pilots `r(m)`, `m >= first`, seeded by `c_init`
fn qpsk_pilots<'a>(c_init: u32, first: usize, out: impl IntoIterator<Item = &'a mut Complex32>) {
    let level = |b: bool| if b { -FRAC_1_SQRT_2 } else { FRAC_1_SQRT_2 };
    let mut bits = GoldBits::new(c_init).skip(2 * first);
    for p in out {
        let (Some(re), Some(im)) = (bits.next(), bits.next()) else {
            break;
        };
        *p = Complex32::new(level(re), level(im));
    }
}

/// Cell-specific reference signals of one cell
#[derive(Debug, Clone)]
pub struct ReferenceSignalSet {
    cell: CellDescriptor,
    /// Pilot values indexed by [port pair, subframe, pilot index]
    pilots: Array3<Complex32>,
}

impl ReferenceSignalSet {
    /// Compute the CRS table of every port pair and subframe
    pub fn generate(cell: &CellDescriptor) -> Result<Self, PhyError> {
        cell.validate().map_err(PhyError::ConfigurationError)?;

        let nof_prb = cell.nof_prb;
        let n_cp = match cell.cp {
            CyclicPrefix::Normal => 1,
            CyclicPrefix::Extended => 0,
        };
        let id = cell.pci.0 as u32;
        let mut pilots = Array3::zeros((2, NOF_SUBFRAMES, nof_pilots(0, nof_prb)));

        for ns in 0..NOF_SLOTS {
            for pair in 0..2 {
                let symbols_per_slot = nof_symbols(2 * pair) / 2;
                for l in 0..symbols_per_slot {
                    let lp = symbol_index(2 * pair, l, cell.cp) as u32;
                    let c_init = 1024 * (7 * (ns as u32 + 1) + lp + 1) * (2 * id + 1) + 2 * id + n_cp;

                    let sym = (ns % 2) * symbols_per_slot + l;
                    let start = pilot_index(0, sym, nof_prb);
                    let end = start + nof_pilots_per_symbol(nof_prb);
                    let row = pilots.slice_mut(s![pair, ns / 2, start..end]);
                    // m' = m + MAX_PRB - nof_prb selects the centre of the full-band sequence
                    qpsk_pilots(c_init, (MAX_PRB - nof_prb) as usize, row);
                }
            }
        }

        info!(
            "Generated CRS for cell {} ({} PRB, {:?} CP)",
            cell.pci.0, nof_prb, cell.cp
        );

        Ok(Self { cell: *cell, pilots })
    }

    pub fn cell(&self) -> &CellDescriptor {
        &self.cell
    }

    /// Known pilot values of `port` in subframe `sf`
    pub fn pilots(&self, port: usize, sf: usize) -> ArrayView1<'_, Complex32> {
        let n = nof_pilots(port, self.cell.nof_prb);
        self.pilots.slice(s![port / 2, sf % NOF_SUBFRAMES, ..n])
    }

    /// Copy the received samples at the pilot positions of `port` into `pilots`
    pub fn get_sf(&self, port: usize, grid: &[Complex32], pilots: &mut [Complex32]) {
        let nof_prb = self.cell.nof_prb;
        for l in 0..nof_symbols(port) {
            let nsymbol = symbol_index(port, l, self.cell.cp);
            let fidx = frequency_offset(port, l, self.cell.pci);
            for i in 0..nof_pilots_per_symbol(nof_prb) {
                let re = re_index(nof_prb, nsymbol, fidx + 6 * i);
                if let (Some(dst), Some(&src)) = (pilots.get_mut(pilot_index(i, l, nof_prb)), grid.get(re)) {
                    *dst = src;
                }
            }
        }
    }

    /// Write the pilots of `port` for subframe `sf` into a transmit grid
    pub fn put_sf(&self, port: usize, sf: usize, grid: &mut [Complex32]) {
        let nof_prb = self.cell.nof_prb;
        let pilots = self.pilots(port, sf);
        for l in 0..nof_symbols(port) {
            let nsymbol = symbol_index(port, l, self.cell.cp);
            let fidx = frequency_offset(port, l, self.cell.pci);
            for i in 0..nof_pilots_per_symbol(nof_prb) {
                if let Some(re) = grid.get_mut(re_index(nof_prb, nsymbol, fidx + 6 * i)) {
                    *re = pilots[pilot_index(i, l, nof_prb)];
                }
            }
        }
    }
}

/// MBSFN reference signals of one area
#[derive(Debug, Clone)]
pub struct MbsfnSignalSet {
    area_id: u16,
    nof_prb: u32,
    /// Pilot values indexed by [subframe, pilot index]
    pilots: Array2<Complex32>,
}

impl MbsfnSignalSet {
    /// Compute the MBSFN pilot table of `area_id` for a carrier of `nof_prb` PRB
    pub fn generate(area_id: u16, nof_prb: u32) -> Result<Self, PhyError> {
        if nof_prb == 0 || nof_prb > MAX_PRB {
            return Err(PhyError::ConfigurationError(format!(
                "Invalid number of PRB {} for MBSFN area {}",
                nof_prb, area_id
            )));
        }

        let area = area_id as u32;
        let per_symbol = mbsfn_nof_pilots_per_symbol(nof_prb);
        let mut pilots = Array2::zeros((NOF_SUBFRAMES, mbsfn_nof_pilots(nof_prb)));

        for sf in 0..NOF_SUBFRAMES {
            for l in 0..MBSFN_SYMBOLS {
                let nsymbol = mbsfn_symbol_index(l);
                let slot = (2 * sf + usize::from(l > 0)) as u32;
                let lp = (nsymbol % 6) as u32;
                let c_init = 512 * (7 * (slot + 1) + lp + 1) * (2 * area + 1) + area;

                let row = pilots.slice_mut(s![sf, per_symbol * l..per_symbol * (l + 1)]);
                qpsk_pilots(c_init, 3 * (MAX_PRB - nof_prb) as usize, row);
            }
        }

        debug!("Generated MBSFN pilots for area {} ({} PRB)", area_id, nof_prb);

        Ok(Self {
            area_id,
            nof_prb,
            pilots,
        })
    }

    pub fn area_id(&self) -> u16 {
        self.area_id
    }

    pub fn nof_prb(&self) -> u32 {
        self.nof_prb
    }

    pub fn pilots(&self, sf: usize) -> ArrayView1<'_, Complex32> {
        self.pilots.slice(s![sf % NOF_SUBFRAMES, ..])
    }

    /// Copy the received MBSFN pilots out of a 12-symbol subframe grid
    pub fn get_sf(&self, grid: &[Complex32], pilots: &mut [Complex32]) {
        let per_symbol = mbsfn_nof_pilots_per_symbol(self.nof_prb);
        for l in 0..MBSFN_SYMBOLS {
            let nsymbol = mbsfn_symbol_index(l);
            let fidx = mbsfn_frequency_offset(l);
            for i in 0..per_symbol {
                let re = re_index(self.nof_prb, nsymbol, fidx + 2 * i);
                if let (Some(dst), Some(&src)) = (pilots.get_mut(per_symbol * l + i), grid.get(re)) {
                    *dst = src;
                }
            }
        }
    }

    /// Write the MBSFN pilots of subframe `sf` into a 12-symbol transmit grid
    pub fn put_sf(&self, sf: usize, grid: &mut [Complex32]) {
        let per_symbol = mbsfn_nof_pilots_per_symbol(self.nof_prb);
        let pilots = self.pilots(sf);
        for l in 0..MBSFN_SYMBOLS {
            let nsymbol = mbsfn_symbol_index(l);
            let fidx = mbsfn_frequency_offset(l);
            for i in 0..per_symbol {
                if let Some(re) = grid.get_mut(re_index(self.nof_prb, nsymbol, fidx + 2 * i)) {
                    *re = pilots[per_symbol * l + i];
                }
            }
        }
    }
}

/// Largest CRS pilot vector of any port
pub fn max_nof_pilots(nof_prb: u32) -> usize {
    MAX_CRS_SYMBOLS * nof_pilots_per_symbol(nof_prb)
}
