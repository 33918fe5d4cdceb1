//! Downlink Channel Estimation
//!
//! Least-squares estimation on the cell-specific (or MBSFN) reference signals,
//! followed by optional frequency smoothing, interpolation to every resource
//! element, noise estimation and link quality metrics. All working buffers are
//! allocated for the largest carrier at construction.

pub mod filter;
pub mod noise;
pub mod wiener;

use crate::config::{EstimatorAlgorithm, EstimatorConfig, FilterType, MAX_FILTER_LEN};
use crate::interp::{conv_same, interp_linear_vector, LinearInterpolator};
use crate::refsignal::{self, MbsfnSignalSet, ReferenceSignalSet, MBSFN_PORT, MBSFN_SYMBOLS_PER_SUBFRAME};
use crate::PhyError;
use common::types::{CellDescriptor, CyclicPrefix, MAX_PORTS, MAX_PRB, MIN_PRB, NOF_SUBFRAMES, NRE};
use common::utils::{avg_power, power_to_db, power_to_dbm, symbol_size};
use filter::{gauss_filter, merge_rows, triangle_filter};
use noise::{NoiseContext, NoiseEstimators, PilotDifference, PilotLayout};
use num_complex::Complex32;
use std::f32::consts::PI;
use tracing::{debug, info, trace, warn};
use wiener::WienerFilter;

/// Subcarrier distance between CRS pilots of one symbol
const CRS_SPACING: usize = 6;

/// Subcarrier distance between MBSFN pilots of one symbol
const MBSFN_SPACING: usize = 2;

/// Timing errors below this many samples are left uncorrected
const SYNC_ERROR_THRESHOLD: f32 = 0.05;

/// Most pilot-bearing symbols of any port in one subframe
const MAX_PILOT_SYMBOLS: usize = 4;

/// Kind of subframe being estimated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubframeType {
    #[default]
    Normal,
    /// Multicast subframe carrying MBSFN reference signals
    Mbsfn,
}

/// Per-subframe parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubframeConfig {
    pub tti: u32,
    pub sf_type: SubframeType,
}

impl SubframeConfig {
    pub fn new(tti: u32) -> Self {
        Self {
            tti,
            sf_type: SubframeType::Normal,
        }
    }

    pub fn mbsfn(tti: u32) -> Self {
        Self {
            tti,
            sf_type: SubframeType::Mbsfn,
        }
    }

    /// Subframe index within the radio frame
    pub fn sf_idx(&self) -> usize {
        self.tti as usize % NOF_SUBFRAMES
    }
}

/// Channel estimate and link metrics of one subframe
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEstimateResult {
    /// Estimate per resource element, indexed `[port][antenna][re]`.
    /// MBSFN subframes write port slot 0.
    pub ce: Vec<Vec<Vec<Complex32>>>,
    /// Carrier frequency offset in subcarrier spacings, updated on enabled subframes
    pub cfo: f32,
    pub noise_estimate: f32,
    pub noise_estimate_dbm: f32,
    pub rsrp: f32,
    pub rsrp_dbm: f32,
    pub rsrp_port_dbm: [f32; MAX_PORTS],
    pub rsrp_ant_port_dbm: Vec<[f32; MAX_PORTS]>,
    pub rsrq: f32,
    pub rsrq_db: f32,
    pub rsrq_ant_port_db: Vec<[f32; MAX_PORTS]>,
    pub rssi: f32,
    pub rssi_dbm: f32,
    pub snr: f32,
    pub snr_db: f32,
    pub snr_ant_port_db: Vec<[f32; MAX_PORTS]>,
    /// Timing error of antenna 0 in samples
    pub sync_error: f32,
}

impl ChannelEstimateResult {
    /// Allocate a result able to hold `max_prb` resource blocks on `nof_rx_antennas`
    pub fn new(max_prb: u32, nof_rx_antennas: usize) -> Self {
        let nof_re = max_prb as usize * NRE * CyclicPrefix::Normal.symbols_per_subframe();
        Self {
            ce: vec![vec![vec![Complex32::new(0.0, 0.0); nof_re]; nof_rx_antennas]; MAX_PORTS],
            cfo: 0.0,
            noise_estimate: 0.0,
            noise_estimate_dbm: f32::NEG_INFINITY,
            rsrp: 0.0,
            rsrp_dbm: f32::NEG_INFINITY,
            rsrp_port_dbm: [f32::NEG_INFINITY; MAX_PORTS],
            rsrp_ant_port_dbm: vec![[f32::NEG_INFINITY; MAX_PORTS]; nof_rx_antennas],
            rsrq: 0.0,
            rsrq_db: f32::NEG_INFINITY,
            rsrq_ant_port_db: vec![[f32::NEG_INFINITY; MAX_PORTS]; nof_rx_antennas],
            rssi: 0.0,
            rssi_dbm: f32::NEG_INFINITY,
            snr: 0.0,
            snr_db: f32::NEG_INFINITY,
            snr_ant_port_db: vec![[0.0; MAX_PORTS]; nof_rx_antennas],
            sync_error: 0.0,
        }
    }
}

/// Pilot placement of one port in one subframe
#[derive(Debug, Clone, Copy)]
struct PortGeometry {
    nof_symbols: usize,
    per_symbol: usize,
    spacing: usize,
    /// Subframe symbol of each pilot-bearing symbol
    symbols: [usize; MAX_PILOT_SYMBOLS],
    /// Subcarrier of the first pilot of each pilot-bearing symbol
    offsets: [usize; MAX_PILOT_SYMBOLS],
    symbols_per_subframe: usize,
}

impl PortGeometry {
    fn crs(cell: &CellDescriptor, port: usize) -> Self {
        let nof_symbols = refsignal::nof_symbols(port);
        let mut symbols = [0; MAX_PILOT_SYMBOLS];
        let mut offsets = [0; MAX_PILOT_SYMBOLS];
        for l in 0..nof_symbols {
            symbols[l] = refsignal::symbol_index(port, l, cell.cp);
            offsets[l] = refsignal::frequency_offset(port, l, cell.pci);
        }
        Self {
            nof_symbols,
            per_symbol: refsignal::nof_pilots_per_symbol(cell.nof_prb),
            spacing: CRS_SPACING,
            symbols,
            offsets,
            symbols_per_subframe: cell.cp.symbols_per_subframe(),
        }
    }

    fn mbsfn(nof_prb: u32) -> Self {
        let nof_symbols = refsignal::mbsfn_nof_symbols();
        let mut symbols = [0; MAX_PILOT_SYMBOLS];
        let mut offsets = [0; MAX_PILOT_SYMBOLS];
        for l in 0..nof_symbols {
            symbols[l] = refsignal::mbsfn_symbol_index(l);
            offsets[l] = refsignal::mbsfn_frequency_offset(l);
        }
        Self {
            nof_symbols,
            per_symbol: refsignal::mbsfn_nof_pilots_per_symbol(nof_prb),
            spacing: MBSFN_SPACING,
            symbols,
            offsets,
            symbols_per_subframe: MBSFN_SYMBOLS_PER_SUBFRAME,
        }
    }

    fn nof_pilots(&self) -> usize {
        self.nof_symbols * self.per_symbol
    }

    fn layout(&self) -> PilotLayout<'_> {
        PilotLayout {
            nof_symbols: self.nof_symbols,
            pilots_per_symbol: self.per_symbol,
            spacing: self.spacing,
            offsets: &self.offsets[..self.nof_symbols],
        }
    }
}

/// Everything derived from the current cell
#[derive(Debug)]
struct CellState {
    cell: CellDescriptor,
    fft_size: usize,
    csr: ReferenceSignalSet,
    mbsfn: Option<MbsfnSignalSet>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PortMetrics {
    rsrp: f32,
    rssi: f32,
    noise: f32,
}

/// Preallocated buffers and per-stream state
#[derive(Debug)]
struct Workspace {
    pilot_recv: Vec<Complex32>,
    pilot_est: Vec<Complex32>,
    pilot_avg: Vec<Complex32>,
    pilot_smooth: Vec<Complex32>,
    /// Frequency-interpolated pilot symbols, one row of subcarriers each
    symbols: Vec<Complex32>,
    taps: Vec<f32>,
    interp_crs: LinearInterpolator,
    interp_mbsfn: LinearInterpolator,
    /// Interpolators for the time-averaged rows at half the pilot spacing
    interp_crs_merged: LinearInterpolator,
    interp_mbsfn_merged: LinearInterpolator,
    noise: NoiseEstimators,
    wiener: WienerFilter,
    metrics: Vec<[PortMetrics; MAX_PORTS]>,
    cfo: Option<f32>,
}

/// Downlink channel estimator for one cell and a fixed set of receive antennas
#[derive(Debug)]
pub struct ChannelEstimator {
    max_prb: u32,
    nof_rx_antennas: usize,
    cell: Option<CellState>,
    work: Workspace,
}

impl ChannelEstimator {
    /// Allocate an estimator for carriers of up to `max_prb` resource blocks
    pub fn new(max_prb: u32, nof_rx_antennas: usize) -> Result<Self, PhyError> {
        if !(MIN_PRB..=MAX_PRB).contains(&max_prb) {
            return Err(PhyError::ConfigurationError(format!(
                "Invalid maximum number of PRB {}",
                max_prb
            )));
        }
        if nof_rx_antennas == 0 {
            return Err(PhyError::ConfigurationError(
                "At least one receive antenna is required".to_string(),
            ));
        }

        let max_pilots = refsignal::max_nof_pilots(max_prb).max(refsignal::mbsfn_nof_pilots(max_prb));
        let max_sc = max_prb as usize * NRE;

        info!(
            "Channel estimator allocated for {} PRB and {} antennas",
            max_prb, nof_rx_antennas
        );

        Ok(Self {
            max_prb,
            nof_rx_antennas,
            cell: None,
            work: Workspace {
                pilot_recv: vec![Complex32::new(0.0, 0.0); max_pilots],
                pilot_est: vec![Complex32::new(0.0, 0.0); max_pilots],
                pilot_avg: vec![Complex32::new(0.0, 0.0); max_pilots],
                pilot_smooth: vec![Complex32::new(0.0, 0.0); max_pilots],
                symbols: vec![Complex32::new(0.0, 0.0); MAX_PILOT_SYMBOLS * max_sc],
                taps: Vec::with_capacity(2 * max_sc + 1),
                interp_crs: LinearInterpolator::new(refsignal::nof_pilots_per_symbol(max_prb), CRS_SPACING)?,
                interp_mbsfn: LinearInterpolator::new(
                    refsignal::mbsfn_nof_pilots_per_symbol(max_prb),
                    MBSFN_SPACING,
                )?,
                interp_crs_merged: LinearInterpolator::new(
                    2 * refsignal::nof_pilots_per_symbol(max_prb),
                    CRS_SPACING / 2,
                )?,
                interp_mbsfn_merged: LinearInterpolator::new(
                    2 * refsignal::mbsfn_nof_pilots_per_symbol(max_prb),
                    MBSFN_SPACING / 2,
                )?,
                noise: NoiseEstimators::new(nof_rx_antennas),
                wiener: WienerFilter::new(MAX_PORTS, nof_rx_antennas, MAX_PILOT_SYMBOLS),
                metrics: vec![[PortMetrics::default(); MAX_PORTS]; nof_rx_antennas],
                cfo: None,
            },
        })
    }

    pub fn max_prb(&self) -> u32 {
        self.max_prb
    }

    pub fn nof_rx_antennas(&self) -> usize {
        self.nof_rx_antennas
    }

    pub fn cell(&self) -> Option<&CellDescriptor> {
        self.cell.as_ref().map(|s| &s.cell)
    }

    /// Configure the cell, regenerating its reference signals when it changed
    pub fn set_cell(&mut self, cell: &CellDescriptor) -> Result<(), PhyError> {
        cell.validate().map_err(PhyError::ConfigurationError)?;
        if cell.nof_prb > self.max_prb {
            warn!(
                "Rejected cell with {} PRB, estimator allocated for {}",
                cell.nof_prb, self.max_prb
            );
            return Err(PhyError::CapacityExceeded {
                what: "channel estimator PRB",
                requested: cell.nof_prb as usize,
                capacity: self.max_prb as usize,
            });
        }
        if self.cell.as_ref().is_some_and(|s| s.cell == *cell) {
            return Ok(());
        }

        let fft_size = symbol_size(cell.nof_prb).ok_or_else(|| {
            PhyError::ConfigurationError(format!("No FFT size for {} PRB", cell.nof_prb))
        })?;
        let csr = ReferenceSignalSet::generate(cell)?;
        let mbsfn = match self.cell.as_ref().and_then(|s| s.mbsfn.as_ref()) {
            Some(set) => Some(MbsfnSignalSet::generate(set.area_id(), cell.nof_prb)?),
            None => None,
        };

        self.work.interp_crs.resize(refsignal::nof_pilots_per_symbol(cell.nof_prb))?;
        self.work
            .interp_mbsfn
            .resize(refsignal::mbsfn_nof_pilots_per_symbol(cell.nof_prb))?;
        self.work
            .interp_crs_merged
            .resize(2 * refsignal::nof_pilots_per_symbol(cell.nof_prb))?;
        self.work
            .interp_mbsfn_merged
            .resize(2 * refsignal::mbsfn_nof_pilots_per_symbol(cell.nof_prb))?;
        self.work.noise.clear();
        self.work.wiener.reset();
        self.work.metrics.iter_mut().for_each(|m| *m = [PortMetrics::default(); MAX_PORTS]);
        self.work.cfo = None;

        info!(
            "Channel estimator set to cell {} ({} PRB, {} ports, {:?} CP)",
            cell.pci.0, cell.nof_prb, cell.nof_ports, cell.cp
        );

        self.cell = Some(CellState {
            cell: *cell,
            fft_size,
            csr,
            mbsfn,
        });
        Ok(())
    }

    /// Generate the MBSFN pilots of `area_id` for the current cell
    pub fn set_mbsfn_area_id(&mut self, area_id: u16) -> Result<(), PhyError> {
        let state = self.cell.as_mut().ok_or_else(|| {
            PhyError::ConfigurationError("MBSFN area set before the cell".to_string())
        })?;
        if state.mbsfn.as_ref().is_some_and(|m| m.area_id() == area_id) {
            return Ok(());
        }
        state.mbsfn = Some(MbsfnSignalSet::generate(area_id, state.cell.nof_prb)?);
        info!("MBSFN area {} configured", area_id);
        Ok(())
    }

    /// Estimate the channel of one subframe.
    ///
    /// `grid` holds one frequency-domain subframe per receive antenna. When
    /// timing error correction is enabled the grids are corrected in place.
    pub fn estimate(
        &mut self,
        sf: &SubframeConfig,
        cfg: &EstimatorConfig,
        grid: &mut [Vec<Complex32>],
        res: &mut ChannelEstimateResult,
    ) -> Result<(), PhyError> {
        cfg.validate()?;
        let mbsfn = sf.sf_type == SubframeType::Mbsfn;
        if mbsfn {
            match cfg.mbsfn_area_id {
                Some(area) => self.set_mbsfn_area_id(area)?,
                None if self.cell.as_ref().is_some_and(|s| s.mbsfn.is_some()) => {}
                None => {
                    return Err(PhyError::ConfigurationError(
                        "MBSFN subframe requested without an MBSFN area".to_string(),
                    ))
                }
            }
        }

        let state = self.cell.as_ref().ok_or_else(|| {
            PhyError::ConfigurationError("Channel estimator has no cell configured".to_string())
        })?;
        let cell = state.cell;
        let nof_re = cell.nof_re();
        let nof_ant = grid.len();
        if nof_ant == 0 {
            return Err(PhyError::ConfigurationError("No receive antenna grid".to_string()));
        }
        if nof_ant > self.nof_rx_antennas {
            return Err(PhyError::CapacityExceeded {
                what: "receive antennas",
                requested: nof_ant,
                capacity: self.nof_rx_antennas,
            });
        }
        if let Some(short) = grid.iter().find(|g| g.len() < nof_re) {
            return Err(PhyError::ConfigurationError(format!(
                "Resource grid of {} samples, cell needs {}",
                short.len(),
                nof_re
            )));
        }
        let nof_ports = if mbsfn { 1 } else { cell.nof_ports as usize };
        let res_ok = res.ce.len() >= nof_ports
            && res.ce[..nof_ports].iter().all(|p| {
                p.len() >= nof_ant && p[..nof_ant].iter().all(|c| c.len() >= nof_re)
            })
            && res.rsrp_ant_port_dbm.len() >= nof_ant
            && res.rsrq_ant_port_db.len() >= nof_ant
            && res.snr_ant_port_db.len() >= nof_ant;
        if !res_ok {
            return Err(PhyError::CapacityExceeded {
                what: "channel estimate result",
                requested: nof_re,
                capacity: res.ce.first().and_then(|p| p.first()).map_or(0, |c| c.len()),
            });
        }

        let sf_idx = sf.sf_idx();

        if cfg.sync_error_enable && !mbsfn {
            for (a, g) in grid.iter_mut().enumerate() {
                let delta = self.work.sync_error(state, sf_idx, g)?;
                if delta.is_finite() && delta.abs() > SYNC_ERROR_THRESHOLD {
                    correct_timing(g, cell.nof_prb, state.fft_size, delta);
                    debug!("Corrected timing error of {:.3} samples on antenna {}", delta, a);
                }
                if a == 0 {
                    res.sync_error = delta;
                }
            }
        }

        let want_cfo = cfg.cfo_estimate_enable && cfg.cfo_estimate_mask.contains_subframe(sf_idx) && !mbsfn;
        self.work.cfo = None;

        for (a, g) in grid.iter().enumerate() {
            for p in 0..nof_ports {
                let ce = &mut res.ce[p][a][..nof_re];
                self.work
                    .estimate_port(state, sf_idx, mbsfn, cfg, a, p, want_cfo && a == 0 && p == 0, g, ce)?;
            }
        }

        if let Some(cfo) = self.work.cfo {
            res.cfo = cfo;
        }
        self.work.aggregate(cell.nof_prb, nof_ant, nof_ports, res);

        debug!(
            "sf {} RSRP {:.1} dBm, RSRQ {:.1} dB, noise {:.1} dBm, SNR {:.1} dB",
            sf_idx, res.rsrp_dbm, res.rsrq_db, res.noise_estimate_dbm, res.snr_db
        );
        Ok(())
    }
}

impl Workspace {
    /// Timing error of one antenna, power-weighted across ports, in samples
    fn sync_error(&mut self, state: &CellState, sf_idx: usize, grid: &[Complex32]) -> Result<f32, PhyError> {
        let cell = &state.cell;
        let mut weighted = 0.0f32;
        let mut total = 0.0f32;

        for port in 0..cell.nof_ports as usize {
            let geo = PortGeometry::crs(cell, port);
            let n = geo.nof_pilots();
            if n == 0 {
                return Err(zero_pilots(port));
            }
            let recv = &mut self.pilot_recv[..n];
            let est = &mut self.pilot_est[..n];
            state.csr.get_sf(port, grid, recv);
            for ((e, r), k) in est.iter_mut().zip(recv.iter()).zip(state.csr.pilots(port, sf_idx).iter()) {
                *e = r * k.conj();
            }

            // The pair straddling DC is one subcarrier further apart
            let half = cell.nof_subcarriers() / 2;
            let slope: Complex32 = est
                .chunks(geo.per_symbol)
                .zip(geo.offsets.iter())
                .map(|(row, &off)| {
                    row.windows(2)
                        .enumerate()
                        .filter(|(i, _)| {
                            let k = off + geo.spacing * i;
                            !(k < half && k + geo.spacing >= half)
                        })
                        .map(|(_, w)| w[1] * w[0].conj())
                        .sum::<Complex32>()
                })
                .sum();
            let delta = -slope.arg() * state.fft_size as f32 / (2.0 * PI * geo.spacing as f32);
            let power = avg_power(recv);
            trace!("Port {} timing error {:.3} samples (power {:.3e})", port, delta, power);
            if delta.is_finite() {
                weighted += power * delta;
                total += power;
            }
        }

        if total > 0.0 {
            Ok(weighted / total)
        } else {
            Ok(0.0)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn estimate_port(
        &mut self,
        state: &CellState,
        sf_idx: usize,
        mbsfn: bool,
        cfg: &EstimatorConfig,
        antenna: usize,
        port: usize,
        want_cfo: bool,
        grid: &[Complex32],
        ce: &mut [Complex32],
    ) -> Result<(), PhyError> {
        let cell = &state.cell;
        let geo = if mbsfn {
            PortGeometry::mbsfn(cell.nof_prb)
        } else {
            PortGeometry::crs(cell, port)
        };
        let n = geo.nof_pilots();
        if n == 0 {
            return Err(zero_pilots(if mbsfn { MBSFN_PORT } else { port }));
        }
        let nsc = cell.nof_subcarriers();

        // Least squares against the known pilots
        let recv = &mut self.pilot_recv[..n];
        let est = &mut self.pilot_est[..n];
        if mbsfn {
            let set = state.mbsfn.as_ref().ok_or_else(|| {
                PhyError::ConfigurationError("MBSFN subframe requested without an MBSFN area".to_string())
            })?;
            set.get_sf(grid, recv);
            for ((e, r), k) in est.iter_mut().zip(recv.iter()).zip(set.pilots(sf_idx).iter()) {
                *e = r * k.conj();
            }
        } else {
            state.csr.get_sf(port, grid, recv);
            for ((e, r), k) in est.iter_mut().zip(recv.iter()).zip(state.csr.pilots(port, sf_idx).iter()) {
                *e = r * k.conj();
            }
        }

        let rsrp = avg_power(recv);
        let rssi = geo.symbols[..geo.nof_symbols]
            .iter()
            .map(|&s| {
                let start = refsignal::re_index(cell.nof_prb, s, 0);
                grid.get(start..start + nsc).map_or(0.0, |row| row.iter().map(|v| v.norm_sqr()).sum())
            })
            .sum::<f32>()
            / geo.nof_symbols as f32;

        if want_cfo && geo.nof_symbols == MAX_PILOT_SYMBOLS {
            let cfo = pilot_cfo(est, geo.per_symbol, cell.cp.subframe_len(state.fft_size) / 2, state.fft_size);
            trace!("Pilot CFO {:.4}", cfo);
            self.cfo = Some(cfo);
        }

        let raw_noise = PilotDifference::estimate(est, &geo.layout());
        let slot = if mbsfn { 0 } else { port };

        let mut wiener_done = false;
        if cfg.estimator_alg == EstimatorAlgorithm::Wiener && !mbsfn {
            let prev_noise = self.metrics[antenna][slot].noise;
            let snr = rsrp / prev_noise;
            let snr = if snr.is_finite() { snr } else { f32::INFINITY };
            for l in 0..geo.nof_symbols {
                let row = &est[l * geo.per_symbol..(l + 1) * geo.per_symbol];
                self.wiener.update(port, antenna, l, geo.offsets[l], row);
            }
            if (0..geo.nof_symbols).all(|l| self.wiener.ready(port, antenna, l, geo.offsets[l])) {
                for l in 0..geo.nof_symbols {
                    let row = &est[l * geo.per_symbol..(l + 1) * geo.per_symbol];
                    let out = &mut self.symbols[l * nsc..(l + 1) * nsc];
                    self.wiener
                        .run(port, antenna, l, row, geo.offsets[l], geo.spacing, snr, out);
                }
                time_interpolate(&self.symbols, nsc, &geo, ce);
                wiener_done = true;
            }
        }

        if !wiener_done {
            let ps = geo.per_symbol;

            if cfg.estimator_alg == EstimatorAlgorithm::Average {
                let merged = merge_rows(est, ps, &geo.offsets[..geo.nof_symbols], geo.spacing, &mut self.pilot_avg);
                let avg = &self.pilot_avg[..merged.len];
                let smooth = &mut self.pilot_smooth[..merged.len];
                if design_filter(cfg, raw_noise, rsrp, merged.len, &mut self.taps) {
                    conv_same(avg, &self.taps, smooth);
                } else {
                    smooth.copy_from_slice(avg);
                }
                let interp = match (mbsfn, merged.spacing < geo.spacing) {
                    (false, false) => &self.interp_crs,
                    (false, true) => &self.interp_crs_merged,
                    (true, false) => &self.interp_mbsfn,
                    (true, true) => &self.interp_mbsfn_merged,
                };
                let out = &mut self.symbols[..nsc];
                interp.run_offset(smooth, out, merged.offset, merged.spacing - merged.offset);
                for s in 0..geo.symbols_per_subframe {
                    ce[s * nsc..(s + 1) * nsc].copy_from_slice(out);
                }
            } else {
                let smoothing = design_filter(cfg, raw_noise, rsrp, ps, &mut self.taps);
                let interp = if mbsfn { &self.interp_mbsfn } else { &self.interp_crs };
                let smooth = &mut self.pilot_smooth[..n];
                for l in 0..geo.nof_symbols {
                    let row = &est[l * ps..(l + 1) * ps];
                    let dst = &mut smooth[l * ps..(l + 1) * ps];
                    if smoothing {
                        conv_same(row, &self.taps, dst);
                    } else {
                        dst.copy_from_slice(row);
                    }
                    let out = &mut self.symbols[l * nsc..(l + 1) * nsc];
                    interp.run_offset(dst, out, geo.offsets[l], geo.spacing - geo.offsets[l]);
                }
                time_interpolate(&self.symbols, nsc, &geo, ce);
            }
        }
        // REs outside the MBSFN region carry no estimate
        ce[geo.symbols_per_subframe * nsc..].fill(Complex32::new(0.0, 0.0));

        let ctx = NoiseContext {
            cell,
            sf_idx,
            antenna,
            port,
            pilots: &self.pilot_est[..n],
            layout: geo.layout(),
            grid,
            ce,
        };
        let noise = self.noise.select(cfg.noise_alg).estimate_noise(&ctx);

        trace!(
            "ant {} port {}: RSRP {:.3e} RSSI {:.3e} noise {:.3e}",
            antenna,
            port,
            rsrp,
            rssi,
            noise
        );
        self.metrics[antenna][slot] = PortMetrics { rsrp, rssi, noise };
        Ok(())
    }

    /// Combine the per-(antenna, port) measurements into the result
    fn aggregate(&self, nof_prb: u32, nof_ant: usize, nof_ports: usize, res: &mut ChannelEstimateResult) {
        let ant_f = nof_ant as f32;
        let metrics = &self.metrics[..nof_ant];

        res.noise_estimate = metrics
            .iter()
            .map(|m| m[..nof_ports].iter().map(|x| x.noise).sum::<f32>() / nof_ports as f32)
            .sum::<f32>()
            / ant_f;

        let mut rsrp = 0.0f32;
        res.rsrp_port_dbm = [f32::NEG_INFINITY; MAX_PORTS];
        for p in 0..nof_ports {
            let port_rsrp = metrics.iter().map(|m| m[p].rsrp).sum::<f32>() / ant_f;
            res.rsrp_port_dbm[p] = power_to_dbm(port_rsrp);
            rsrp = rsrp.max(port_rsrp);
        }
        res.rsrp = rsrp;

        res.rssi = metrics.iter().map(|m| m[0].rssi).sum::<f32>() / ant_f;
        res.rsrq = metrics.iter().map(|m| rsrq(nof_prb, &m[0])).sum::<f32>() / ant_f;
        res.snr = ratio(res.rsrp, res.noise_estimate);

        for (a, m) in metrics.iter().enumerate() {
            res.rsrp_ant_port_dbm[a] = [f32::NEG_INFINITY; MAX_PORTS];
            res.rsrq_ant_port_db[a] = [f32::NEG_INFINITY; MAX_PORTS];
            res.snr_ant_port_db[a] = [0.0; MAX_PORTS];
            for (p, x) in m[..nof_ports].iter().enumerate() {
                res.rsrp_ant_port_dbm[a][p] = power_to_dbm(x.rsrp);
                res.rsrq_ant_port_db[a][p] = power_to_db(rsrq(nof_prb, x));
                res.snr_ant_port_db[a][p] = if x.noise > 0.0 {
                    power_to_db(x.rsrp / x.noise)
                } else {
                    0.0
                };
            }
        }

        res.noise_estimate_dbm = power_to_dbm(res.noise_estimate);
        res.rsrp_dbm = power_to_dbm(res.rsrp);
        res.rsrq_db = power_to_db(res.rsrq);
        res.rssi_dbm = power_to_dbm(res.rssi);
        res.snr_db = power_to_db(res.snr);
    }
}

fn zero_pilots(port: usize) -> PhyError {
    PhyError::ConfigurationError(format!("Port {} has no pilots in this subframe", port))
}

fn rsrq(nof_prb: u32, m: &PortMetrics) -> f32 {
    if m.rssi > 0.0 {
        nof_prb as f32 * m.rsrp / m.rssi
    } else {
        0.0
    }
}

fn ratio(num: f32, den: f32) -> f32 {
    if den > 0.0 {
        num / den
    } else if num > 0.0 {
        f32::INFINITY
    } else {
        0.0
    }
}

/// Fill `taps` for the configured smoothing of a row of `nof_pilots`; false
/// when no smoothing applies. The filter never outgrows the row.
fn design_filter(cfg: &EstimatorConfig, noise: f32, rsrp: f32, nof_pilots: usize, taps: &mut Vec<f32>) -> bool {
    let len = (cfg.filter_coef[0] as usize).min(nof_pilots.min(MAX_FILTER_LEN));
    match cfg.filter_type {
        FilterType::None => false,
        FilterType::Gauss => {
            // Spread grows with the relative noise level
            let rel_noise = if rsrp > 0.0 { noise / rsrp } else { 0.0 };
            gauss_filter(len, cfg.filter_coef[1] * rel_noise, taps);
            true
        }
        FilterType::Triangle => {
            triangle_filter(len, taps);
            true
        }
    }
}

/// Frequency index of grid subcarrier `k`, counting the DC subcarrier left
/// out between the two halves of the band
fn subcarrier_frequency(k: usize, nsc: usize) -> usize {
    if k < nsc / 2 {
        k
    } else {
        k + 1
    }
}

/// Expand the interpolated pilot symbols over every symbol of the subframe
fn time_interpolate(symbols: &[Complex32], nsc: usize, geo: &PortGeometry, ce: &mut [Complex32]) {
    let pilots = &geo.symbols[..geo.nof_symbols];
    let row = move |j: usize| &symbols[j * nsc..(j + 1) * nsc];

    for s in 0..geo.symbols_per_subframe {
        let out = &mut ce[s * nsc..(s + 1) * nsc];
        if pilots.len() == 1 {
            out.copy_from_slice(row(0));
            continue;
        }
        let j1 = pilots
            .iter()
            .position(|&p| p > s)
            .unwrap_or(pilots.len() - 1)
            .clamp(1, pilots.len() - 1);
        let j0 = j1 - 1;
        let t = (s as f32 - pilots[j0] as f32) / (pilots[j1] - pilots[j0]) as f32;
        interp_linear_vector(row(j0), row(j1), t, out);
    }
}

/// CFO from the phase drift between pilot symbols one slot apart
fn pilot_cfo(est: &[Complex32], per_symbol: usize, slot_len: usize, fft_size: usize) -> f32 {
    let row = move |l: usize| &est[l * per_symbol..(l + 1) * per_symbol];
    let acc: Complex32 = (0..2)
        .map(|i| row(i + 2).iter().zip(row(i)).map(|(b, a)| b * a.conj()).sum::<Complex32>())
        .sum();
    acc.arg() * fft_size as f32 / (2.0 * PI * slot_len as f32)
}

/// Undo a timing error of `delta` samples by rotating every subcarrier
fn correct_timing(grid: &mut [Complex32], nof_prb: u32, fft_size: usize, delta: f32) {
    let nsc = nof_prb as usize * NRE;
    let step = 2.0 * PI * delta / fft_size as f32;
    for row in grid.chunks_mut(nsc) {
        for (k, v) in row.iter_mut().enumerate() {
            *v *= Complex32::from_polar(1.0, step * subcarrier_frequency(k, nsc) as f32);
        }
    }
}
