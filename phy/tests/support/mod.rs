//! Test signal synthesis shared by the integration tests
#![allow(dead_code)]

use common::types::{Bandwidth, CellDescriptor, CyclicPrefix, DuplexMode, Pci};
use num_complex::Complex32;
use phy::refsignal::ReferenceSignalSet;
use phy::sync::pss::pss_put_symbol;
use phy::sync::sss::sss_put_symbol;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn cell(id: u16, nof_prb: u32, cp: CyclicPrefix, nof_ports: u32) -> CellDescriptor {
    CellDescriptor {
        pci: Pci(id),
        nof_prb,
        cp,
        nof_ports,
        duplex: DuplexMode::Fdd,
    }
}

pub fn empty_grid(cell: &CellDescriptor) -> Vec<Complex32> {
    vec![Complex32::new(0.0, 0.0); cell.nof_re()]
}

/// Write PSS and SSS of subframe `sf` (0 or 5) into an FDD grid
pub fn put_sync(cell: &CellDescriptor, sf: usize, grid: &mut [Complex32]) {
    let nsc = cell.nof_subcarriers();
    let nsymb = cell.cp.symbols_per_slot();
    let pss = nsymb - 1;
    let sss = nsymb - 2;
    pss_put_symbol(&mut grid[pss * nsc..(pss + 1) * nsc], cell.nof_prb, cell.pci.sector_id());
    sss_put_symbol(&mut grid[sss * nsc..(sss + 1) * nsc], cell.nof_prb, cell.pci, sf == 5);
}

/// Write the CRS of every port of `cell` for subframe `sf`
pub fn put_crs(cell: &CellDescriptor, sf: usize, grid: &mut [Complex32]) {
    let set = ReferenceSignalSet::generate(cell).unwrap();
    for port in 0..cell.nof_ports as usize {
        set.put_sf(port, sf, grid);
    }
}

pub fn scale(x: &mut [Complex32], gain: Complex32) {
    x.iter_mut().for_each(|v| *v *= gain);
}

/// Add complex white Gaussian noise of the given variance
pub fn add_awgn(x: &mut [Complex32], variance: f32, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, (variance / 2.0).sqrt()).unwrap();
    for v in x.iter_mut() {
        *v += Complex32::new(normal.sample(&mut rng), normal.sample(&mut rng));
    }
}

/// Rotate by `cfo` subcarrier spacings, sample 0 at zero phase
pub fn add_cfo(x: &mut [Complex32], cfo: f32, fft_size: usize) {
    let step = 2.0 * std::f64::consts::PI * cfo as f64 / fft_size as f64;
    for (n, v) in x.iter_mut().enumerate() {
        *v *= Complex32::from_polar(1.0, (step * n as f64) as f32);
    }
}

/// OFDM modulator and demodulator with the LTE subcarrier mapping around DC
pub struct Ofdm {
    pub fft_size: usize,
    pub cp: CyclicPrefix,
    nof_sc: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
}

impl Ofdm {
    pub fn new(nof_prb: u32, cp: CyclicPrefix) -> Self {
        let fft_size = Bandwidth::from_nof_prb(nof_prb).unwrap().fft_size();
        let mut planner = FftPlanner::new();
        Self {
            fft_size,
            cp,
            nof_sc: nof_prb as usize * 12,
            fft: planner.plan_fft_forward(fft_size),
            ifft: planner.plan_fft_inverse(fft_size),
        }
    }

    /// FFT bin of grid subcarrier `k`, skipping DC
    fn bin(&self, k: usize) -> usize {
        let half = self.nof_sc / 2;
        if k < half {
            self.fft_size - half + k
        } else {
            k - half + 1
        }
    }

    pub fn subframe_len(&self) -> usize {
        self.cp.subframe_len(self.fft_size)
    }

    /// Samples from the start of the subframe to the end of slot 0
    pub fn slot_len(&self) -> usize {
        self.subframe_len() / 2
    }

    /// Time-domain samples of one subframe grid
    pub fn modulate(&self, grid: &[Complex32]) -> Vec<Complex32> {
        let n = self.fft_size;
        let nsymb = self.cp.symbols_per_slot();
        let scale = 1.0 / (n as f32).sqrt();
        let mut out = Vec::with_capacity(self.subframe_len());
        let mut bins = vec![Complex32::new(0.0, 0.0); n];

        for (l, row) in grid.chunks(self.nof_sc).take(self.cp.symbols_per_subframe()).enumerate() {
            bins.fill(Complex32::new(0.0, 0.0));
            for (k, &v) in row.iter().enumerate() {
                bins[self.bin(k)] = v;
            }
            self.ifft.process(&mut bins);
            let cp = self.cp.len(l % nsymb, n);
            out.extend(bins[n - cp..].iter().map(|v| v * scale));
            out.extend(bins.iter().map(|v| v * scale));
        }
        out
    }

    /// Resource grid of the subframe starting at `samples[0]`
    pub fn demodulate(&self, samples: &[Complex32]) -> Vec<Complex32> {
        let n = self.fft_size;
        let nsymb = self.cp.symbols_per_slot();
        let scale = 1.0 / (n as f32).sqrt();
        let mut grid = Vec::with_capacity(self.nof_sc * self.cp.symbols_per_subframe());
        let mut bins = vec![Complex32::new(0.0, 0.0); n];
        let mut start = 0;

        for l in 0..self.cp.symbols_per_subframe() {
            start += self.cp.len(l % nsymb, n);
            bins.copy_from_slice(&samples[start..start + n]);
            self.fft.process(&mut bins);
            grid.extend((0..self.nof_sc).map(|k| bins[self.bin(k)] * scale));
            start += n;
        }
        grid
    }
}

/// Grid of subframe `sf` with CRS and, in subframes 0 and 5, PSS and SSS
pub fn downlink_grid(cell: &CellDescriptor, sf: usize) -> Vec<Complex32> {
    let mut grid = empty_grid(cell);
    put_crs(cell, sf, &mut grid);
    if sf == 0 || sf == 5 {
        put_sync(cell, sf, &mut grid);
    }
    grid
}

/// Consecutive subframes `first..first + count` of `cell` as time samples
pub fn downlink_signal(cell: &CellDescriptor, first: usize, count: usize) -> Vec<Complex32> {
    let ofdm = Ofdm::new(cell.nof_prb, cell.cp);
    (first..first + count)
        .flat_map(|sf| ofdm.modulate(&downlink_grid(cell, sf % 10)))
        .collect()
}
