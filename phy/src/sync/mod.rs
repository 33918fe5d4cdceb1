//! Timing and Frequency Synchronization
//!
//! The [`Synchronizer`] locates the PSS of a configured sector in a window of
//! time-domain samples, refines the carrier frequency offset in up to three
//! stages, identifies the cell group and half frame from the SSS and classifies
//! the cyclic prefix length. It keeps smoothed estimates across calls, so one
//! instance tracks one cell.

pub mod cp;
pub mod pss;
pub mod sss;

pub use crate::config::FrameTypeSearch;

use self::cp::CpCorrelator;
use self::pss::{PssDetector, PssPeak, CFO_I_HYPOTHESES};
use self::sss::{SssDetection, SssDetector};
use crate::config::SyncConfig;
use crate::ema::Ema;
use crate::PhyError;
use common::types::{cp_len_ext, cp_len_norm, CyclicPrefix, DuplexMode, Pci, SUBCARRIER_SPACING_HZ};
use common::utils::apply_frequency_shift;
use num_complex::Complex32;
use std::f32::consts::PI;
use tracing::{debug, info, trace, warn};

/// Smallest supported FFT size
pub const MIN_FFT_SIZE: usize = 64;

/// Largest supported FFT size
pub const MAX_FFT_SIZE: usize = 2048;

/// Smoothing factor of the CP length metrics
const CP_EMA_ALPHA: f32 = 0.1;

/// Symbols before the PSS used for CP length detection
const CP_DETECT_MAX_SYMBOLS: usize = 3;

/// PSS-based CFO estimates above this are discarded
const MAX_CFO_PSS_HZ: f32 = 7000.0;

/// Outcome of one [`Synchronizer::find`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    /// Peak accepted with room for SSS and CP processing
    Found,
    /// Peak accepted but too close to the start of the window for SSS/CP work
    FoundNoSpace,
    /// No peak above the threshold
    NotFound,
}

/// Acquisition progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Searching,
    /// A PSS peak was accepted but the cell identity is not confirmed
    PeakCandidate,
    /// PSS and SSS both detected
    Verified,
}

/// Check that `fft_size` is a multiple of 64 within the supported range
pub fn validate_fft_size(fft_size: usize) -> Result<(), PhyError> {
    if fft_size % 64 != 0 || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
        return Err(PhyError::ConfigurationError(format!(
            "Invalid FFT size {} (multiple of 64 in {}-{})",
            fft_size, MIN_FFT_SIZE, MAX_FFT_SIZE
        )));
    }
    Ok(())
}

/// PSS/SSS synchronizer with CFO tracking and CP detection
pub struct Synchronizer {
    max_frame_size: usize,
    offset_capacity: usize,
    max_offset: usize,
    max_fft_size: usize,
    frame_size: usize,
    fft_size: usize,

    threshold: f32,
    ema_alpha: f32,
    cfo_i_enable: bool,
    cfo_cp_enable: bool,
    cfo_pss_enable: bool,
    cfo_cp_nsymbols: usize,
    sss_enable: bool,
    detect_cp: bool,
    frame_type_search: FrameTypeSearch,

    sector: Option<u8>,
    group_id: Option<u16>,
    cp: CyclicPrefix,
    frame_type: DuplexMode,
    cfo_i: i32,
    cfo_cp_mean: Ema,
    cfo_pss_mean: Ema,
    m_norm: Ema,
    m_ext: Ema,
    peak_value: f32,
    peak_position: usize,
    sf_idx: usize,
    sss_detected: bool,
    sss_ratio: f32,
    phase: SyncPhase,

    pss: PssDetector,
    sss: SssDetector,
    cp_corr: CpCorrelator,
    /// Frequency-corrected copy of the input
    work: Vec<Complex32>,
    /// exp(-j 2 pi h n / N) for h = +1 and -1
    cfo_i_corr: [Vec<Complex32>; 2],
}

impl Synchronizer {
    /// Allocate a synchronizer for windows of `max_frame_size` samples searched
    /// from offsets up to `max_offset`, with symbols of up to `max_fft_size`.
    pub fn new(max_frame_size: usize, max_offset: usize, max_fft_size: usize) -> Result<Self, PhyError> {
        validate_fft_size(max_fft_size)?;
        if max_frame_size < max_fft_size {
            return Err(PhyError::ConfigurationError(format!(
                "Frame size {} shorter than FFT size {}",
                max_frame_size, max_fft_size
            )));
        }

        let capacity = max_frame_size + max_offset;
        let defaults = SyncConfig::default();
        let mut sync = Self {
            max_frame_size,
            offset_capacity: max_offset,
            max_offset,
            max_fft_size,
            frame_size: max_frame_size,
            fft_size: max_fft_size,
            threshold: defaults.threshold,
            ema_alpha: defaults.ema_alpha,
            cfo_i_enable: defaults.cfo_i_enable,
            cfo_cp_enable: defaults.cfo_cp_enable,
            cfo_pss_enable: defaults.cfo_pss_enable,
            cfo_cp_nsymbols: defaults.cfo_cp_nsymbols as usize,
            sss_enable: defaults.sss_enable,
            detect_cp: defaults.detect_cp,
            frame_type_search: defaults.frame_type,
            sector: None,
            group_id: None,
            cp: CyclicPrefix::Normal,
            frame_type: DuplexMode::Fdd,
            cfo_i: 0,
            cfo_cp_mean: Ema::new(defaults.ema_alpha),
            cfo_pss_mean: Ema::new(defaults.ema_alpha),
            m_norm: Ema::starting_at(CP_EMA_ALPHA, 0.0),
            m_ext: Ema::starting_at(CP_EMA_ALPHA, 0.0),
            peak_value: 0.0,
            peak_position: 0,
            sf_idx: 0,
            sss_detected: false,
            sss_ratio: 0.0,
            phase: SyncPhase::Searching,
            pss: PssDetector::new(capacity, max_fft_size)?,
            sss: SssDetector::new(max_fft_size)?,
            cp_corr: CpCorrelator::new(max_fft_size)?,
            work: vec![Complex32::new(0.0, 0.0); capacity],
            cfo_i_corr: [
                vec![Complex32::new(0.0, 0.0); capacity],
                vec![Complex32::new(0.0, 0.0); capacity],
            ],
        };
        sync.build_cfo_i_tables();

        info!(
            "Synchronizer allocated: frame {} offset {} FFT {}",
            max_frame_size, max_offset, max_fft_size
        );

        Ok(sync)
    }

    fn build_cfo_i_tables(&mut self) {
        let n = self.fft_size as f32;
        for (table, &h) in self.cfo_i_corr.iter_mut().zip(CFO_I_HYPOTHESES[1..].iter()) {
            let step = -2.0 * PI * h as f32 / n;
            for (i, v) in table.iter_mut().enumerate() {
                // Phase is periodic in N
                let phase = step * (i % self.fft_size) as f32;
                *v = Complex32::from_polar(1.0, phase);
            }
        }
    }

    /// Shrink the working dimensions; never beyond the initial allocation
    pub fn resize(&mut self, frame_size: usize, max_offset: usize, fft_size: usize) -> Result<(), PhyError> {
        validate_fft_size(fft_size)?;
        for (what, requested, capacity) in [
            ("sync frame size", frame_size, self.max_frame_size),
            ("sync max offset", max_offset, self.offset_capacity),
            ("sync FFT size", fft_size, self.max_fft_size),
        ] {
            if requested > capacity {
                warn!("Rejecting {} {} (allocated {})", what, requested, capacity);
                return Err(PhyError::CapacityExceeded {
                    what,
                    requested,
                    capacity,
                });
            }
        }
        if frame_size < fft_size {
            return Err(PhyError::ConfigurationError(format!(
                "Frame size {} shorter than FFT size {}",
                frame_size, fft_size
            )));
        }

        self.frame_size = frame_size;
        self.max_offset = max_offset;
        if fft_size != self.fft_size {
            self.fft_size = fft_size;
            self.pss.set_fft_size(fft_size)?;
            self.sss.set_fft_size(fft_size)?;
            self.cp_corr.resize(fft_size)?;
            self.build_cfo_i_tables();
        }
        debug!("Synchronizer resized: frame {} offset {} FFT {}", frame_size, max_offset, fft_size);
        Ok(())
    }

    /// Select the sector (N_id_2) to search for
    pub fn set_sector(&mut self, sector_id: u8) -> Result<(), PhyError> {
        if sector_id >= Pci::NOF_SECTORS {
            return Err(PhyError::ConfigurationError(format!("Invalid sector id {}", sector_id)));
        }
        if self.sector != Some(sector_id) {
            self.pss.set_sector(sector_id)?;
            self.sss.set_sector(sector_id)?;
            self.sector = Some(sector_id);
            self.reset();
            info!("Synchronizer searching sector {}", sector_id);
        }
        Ok(())
    }

    /// Provide the known cell group so the SSS is checked against it only
    pub fn set_group_id(&mut self, group_id: Option<u16>) -> Result<(), PhyError> {
        self.sss.set_group_id(group_id)?;
        if group_id.is_some() {
            self.group_id = group_id;
        }
        Ok(())
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn set_ema_alpha(&mut self, alpha: f32) {
        self.ema_alpha = alpha;
        self.cfo_cp_mean = self.cfo_cp_mean.with_alpha(alpha);
        self.cfo_pss_mean = self.cfo_pss_mean.with_alpha(alpha);
    }

    pub fn set_cfo_i_enable(&mut self, enable: bool) {
        self.cfo_i_enable = enable;
    }

    pub fn set_cfo_cp_enable(&mut self, enable: bool, nof_symbols: u32) {
        self.cfo_cp_enable = enable;
        self.cfo_cp_nsymbols = nof_symbols.max(1) as usize;
    }

    pub fn set_cfo_pss_enable(&mut self, enable: bool) {
        self.cfo_pss_enable = enable;
    }

    pub fn set_sss_enable(&mut self, enable: bool) {
        self.sss_enable = enable;
    }

    pub fn set_cp_detect_enable(&mut self, enable: bool) {
        self.detect_cp = enable;
    }

    pub fn set_frame_type(&mut self, search: FrameTypeSearch) {
        self.frame_type_search = search;
        match search {
            FrameTypeSearch::Fdd => self.frame_type = DuplexMode::Fdd,
            FrameTypeSearch::Tdd => self.frame_type = DuplexMode::Tdd,
            FrameTypeSearch::Auto => {}
        }
    }

    /// Assumed CP length, used until detection says otherwise
    pub fn set_cp(&mut self, cp: CyclicPrefix) {
        self.cp = cp;
    }

    /// Apply every synchronizer option of `config`
    pub fn apply_config(&mut self, config: &SyncConfig) -> Result<(), PhyError> {
        config.validate()?;
        self.set_threshold(config.threshold);
        self.set_ema_alpha(config.ema_alpha);
        self.set_cfo_i_enable(config.cfo_i_enable);
        self.set_cfo_cp_enable(config.cfo_cp_enable, config.cfo_cp_nsymbols);
        self.set_cfo_pss_enable(config.cfo_pss_enable);
        self.set_sss_enable(config.sss_enable);
        self.set_cp_detect_enable(config.detect_cp);
        self.set_frame_type(config.frame_type);
        Ok(())
    }

    /// Forget all tracked estimates, keeping configuration and sector
    pub fn reset(&mut self) {
        self.cfo_i = 0;
        self.cfo_cp_mean = self.cfo_cp_mean.reset();
        self.cfo_pss_mean = self.cfo_pss_mean.reset();
        self.m_norm = Ema::starting_at(CP_EMA_ALPHA, 0.0);
        self.m_ext = Ema::starting_at(CP_EMA_ALPHA, 0.0);
        self.peak_value = 0.0;
        self.peak_position = 0;
        self.sf_idx = 0;
        self.sss_detected = false;
        self.sss_ratio = 0.0;
        self.phase = SyncPhase::Searching;
        self.group_id = self.sss.known_group();
    }

    /// Search for the PSS in `input` starting at `find_offset`.
    ///
    /// Up to the configured frame size is processed after `find_offset`; the
    /// samples before it are available to the SSS and CP stages.
    pub fn find(&mut self, input: &[Complex32], find_offset: usize) -> Result<FindResult, PhyError> {
        if self.sector.is_none() {
            return Err(PhyError::ConfigurationError("Sector id not set".to_string()));
        }
        if find_offset > self.max_offset {
            return Err(PhyError::CapacityExceeded {
                what: "find offset",
                requested: find_offset,
                capacity: self.max_offset,
            });
        }

        let n = self.fft_size;
        let len = (find_offset + self.frame_size).min(input.len());
        self.sss_detected = false;
        if len < find_offset + n {
            debug!("Window of {} samples too short for PSS search", len.saturating_sub(find_offset));
            self.phase = SyncPhase::Searching;
            return Ok(FindResult::NotFound);
        }
        self.work[..len].copy_from_slice(&input[..len]);

        let mut peak = None;
        if self.cfo_i_enable {
            peak = self.cfo_i_search(find_offset, len);
        }

        if self.cfo_cp_enable {
            self.cfo_cp_estimate(len);
        }

        let peak = match peak.or_else(|| self.pss.find(&self.work[find_offset..len], 0)) {
            Some(p) => p,
            None => {
                self.phase = SyncPhase::Searching;
                return Ok(FindResult::NotFound);
            }
        };

        let position = find_offset + peak.position;
        self.peak_value = peak.psr;
        self.peak_position = position;

        if !(self.threshold == 0.0 || peak.psr >= self.threshold) {
            debug!(
                "PSS peak {:.2} at {} below threshold {:.2}",
                peak.psr, position, self.threshold
            );
            self.phase = SyncPhase::Searching;
            return Ok(FindResult::NotFound);
        }

        if self.cfo_pss_enable && position >= n {
            let cfo = self.pss.cfo_compute(&self.work[position - n..position]);
            if cfo.abs() * SUBCARRIER_SPACING_HZ < MAX_CFO_PSS_HZ {
                self.cfo_pss_mean = self.cfo_pss_mean.update(cfo);
            } else {
                warn!("Discarding PSS CFO estimate {:.3} subcarriers", cfo);
            }
        }

        let result = if position >= 2 * (n + cp_len_ext(n)) {
            if self.sss_enable {
                self.sss_search(position, len);
            }
            if self.detect_cp {
                self.cp = self.detect_cp_length(position);
            }
            self.phase = if self.sss_detected || !self.sss_enable {
                SyncPhase::Verified
            } else {
                SyncPhase::PeakCandidate
            };
            FindResult::Found
        } else {
            self.phase = SyncPhase::PeakCandidate;
            FindResult::FoundNoSpace
        };

        debug!(
            "Sync {:?}: peak {:.2} at {} cfo {:.4} sf {} sss {} cp {:?}",
            result,
            self.peak_value,
            self.peak_position,
            self.cfo(),
            self.sf_idx,
            self.sss_detected,
            self.cp
        );

        Ok(result)
    }

    /// Try the three integer CFO hypotheses and compensate the strongest
    fn cfo_i_search(&mut self, find_offset: usize, len: usize) -> Option<PssPeak> {
        let mut best: Option<(usize, PssPeak)> = None;
        for h in 0..CFO_I_HYPOTHESES.len() {
            if let Some(peak) = self.pss.find(&self.work[find_offset..len], h) {
                if best.map_or(true, |(_, b)| peak.power > b.power) {
                    best = Some((h, peak));
                }
            }
        }

        let (h, peak) = best?;
        self.cfo_i = CFO_I_HYPOTHESES[h];
        if h > 0 {
            for (x, c) in self.work[..len].iter_mut().zip(self.cfo_i_corr[h - 1].iter()) {
                *x *= c;
            }
        }
        trace!("Integer CFO hypothesis {} subcarriers", self.cfo_i);
        Some(peak)
    }

    /// CP-based fractional CFO, folded into the running mean and removed from the window
    fn cfo_cp_estimate(&mut self, len: usize) {
        let n = self.fft_size;
        let offset = self
            .cp_corr
            .correlate(&self.work[..len], n, self.cfo_cp_nsymbols, cp_len_norm(1, n));
        let cfo = self.cp_corr.cfo(offset);
        self.cfo_cp_mean = self.cfo_cp_mean.update(cfo);
        apply_frequency_shift(&mut self.work[..len], -self.cfo_cp_mean.value() / n as f32);
        trace!("CP CFO {:.4}, mean {:.4}", cfo, self.cfo_cp_mean.value());
    }

    /// Start of the SSS symbol for a PSS ending at `position`
    fn sss_start(&self, position: usize, duplex: DuplexMode) -> Option<usize> {
        let n = self.fft_size;
        let cp = self.cp.nominal_len(n);
        let back = match duplex {
            DuplexMode::Fdd => 2 * n + cp,
            // SSS ends subframe 0/5, PSS is the third symbol of the next subframe
            DuplexMode::Tdd => 4 * n + self.cp.len(0, n) + 2 * cp,
        };
        position.checked_sub(back)
    }

    fn sss_search(&mut self, position: usize, len: usize) {
        let n = self.fft_size;
        let candidates: &[DuplexMode] = match self.frame_type_search {
            FrameTypeSearch::Fdd => &[DuplexMode::Fdd],
            FrameTypeSearch::Tdd => &[DuplexMode::Tdd],
            FrameTypeSearch::Auto => &[DuplexMode::Fdd, DuplexMode::Tdd],
        };

        let mut best: Option<(DuplexMode, SssDetection)> = None;
        for &duplex in candidates {
            let start = match self.sss_start(position, duplex) {
                Some(s) if s + n <= len => s,
                _ => continue,
            };
            let sss_symbol = &self.work[start..start + n];
            let detection = if self.sss.known_group().is_some() {
                self.sss.detect_known(sss_symbol)
            } else {
                self.sss.detect(&self.work[position - n..position], sss_symbol)
            };
            if let Some(det) = detection {
                if best.map_or(true, |(_, b)| det.ratio > b.ratio) {
                    best = Some((duplex, det));
                }
            }
        }

        match best {
            Some((duplex, det)) => {
                self.sss_detected = true;
                self.sss_ratio = det.ratio;
                self.group_id = Some(det.group_id);
                self.frame_type = duplex;
                let half = if det.subframe5 { 5 } else { 0 };
                self.sf_idx = match duplex {
                    DuplexMode::Fdd => half,
                    DuplexMode::Tdd => half + 1,
                };
                trace!("SSS group {} {:?} ratio {:.2}", det.group_id, duplex, det.ratio);
            }
            None => {
                debug!("SSS not detected for peak at {}", position);
            }
        }
    }

    /// Compare normal and extended CP correlation over the symbols before the PSS end
    fn detect_cp_length(&mut self, position: usize) -> CyclicPrefix {
        let n = self.fft_size;
        let cp_norm = cp_len_norm(1, n);
        let cp_ext = cp_len_ext(n);
        let nof_symbols = (position / (n + cp_ext)).min(CP_DETECT_MAX_SYMBOLS);
        if nof_symbols == 0 {
            return self.cp;
        }

        let metric = |cp_len: usize| -> (f32, f32) {
            let mut r = 0.0;
            let mut c = 0.0;
            let mut start = position - nof_symbols * (n + cp_len);
            for _ in 0..nof_symbols {
                let prefix = &self.work[start..start + cp_len];
                let tail = &self.work[start + n..start + n + cp_len];
                r += common::utils::dot_prod_conj(tail, prefix).re;
                c += prefix.iter().map(|v| v.norm_sqr()).sum::<f32>();
                start += n + cp_len;
            }
            (r, c)
        };

        let (r_norm, c_norm) = metric(cp_norm);
        let (r_ext, c_ext) = metric(cp_ext);
        let m_norm = if c_norm > 0.0 { r_norm / c_norm } else { 0.0 };
        let m_ext = if c_ext > 0.0 { r_ext / c_ext } else { 0.0 };
        self.m_norm = self.m_norm.update(m_norm);
        self.m_ext = self.m_ext.update(m_ext);

        trace!(
            "CP metrics normal {:.3} extended {:.3}",
            self.m_norm.value(),
            self.m_ext.value()
        );

        if self.m_norm.value() > self.m_ext.value() {
            CyclicPrefix::Normal
        } else if self.m_norm.value() < self.m_ext.value() {
            CyclicPrefix::Extended
        } else if r_norm > r_ext {
            CyclicPrefix::Normal
        } else {
            CyclicPrefix::Extended
        }
    }

    /// Total CFO estimate in subcarriers
    pub fn cfo(&self) -> f32 {
        self.cfo_i as f32 + self.cfo_cp_mean.value() + self.cfo_pss_mean.value()
    }

    pub fn cfo_hz(&self) -> f32 {
        self.cfo() * SUBCARRIER_SPACING_HZ
    }

    /// Integer part of the CFO found by the hypothesis search
    pub fn cfo_i(&self) -> i32 {
        self.cfo_i
    }

    /// Peak-to-side-lobe ratio of the last peak
    pub fn peak_value(&self) -> f32 {
        self.peak_value
    }

    /// Sample index in the last input one past the end of the PSS symbol
    pub fn peak_position(&self) -> usize {
        self.peak_position
    }

    /// Subframe carrying the detected PSS
    pub fn sf_idx(&self) -> usize {
        self.sf_idx
    }

    pub fn sector(&self) -> Option<u8> {
        self.sector
    }

    pub fn group_id(&self) -> Option<u16> {
        self.group_id
    }

    pub fn cell_id(&self) -> Option<Pci> {
        match (self.group_id, self.sector) {
            (Some(g), Some(s)) => Pci::from_parts(g, s),
            _ => None,
        }
    }

    pub fn cp(&self) -> CyclicPrefix {
        self.cp
    }

    pub fn frame_type(&self) -> DuplexMode {
        self.frame_type
    }

    pub fn sss_detected(&self) -> bool {
        self.sss_detected
    }

    /// Confidence of the last SSS detection
    pub fn sss_ratio(&self) -> f32 {
        self.sss_ratio
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}
