//! Primary Synchronization Signal
//!
//! LTE PSS generation (3GPP TS 36.211 Section 6.11.1) and FFT-based search of
//! the time-domain PSS replica in a received frame.

use crate::PhyError;
use common::utils::next_power_of_2;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::{debug, trace};

/// PSS sequence length (subcarriers)
pub const PSS_LEN: usize = 62;

/// Zadoff-Chu root for each sector id
const PSS_ROOTS: [u32; 3] = [25, 29, 34];

/// Integer CFO hypotheses in subcarriers, index 0 is the uncompensated search
pub const CFO_I_HYPOTHESES: [i32; 3] = [0, 1, -1];

/// Length-62 Zadoff-Chu PSS of `sector_id` (0-2)
pub fn pss_sequence(sector_id: u8) -> [Complex32; PSS_LEN] {
    let u = PSS_ROOTS[sector_id as usize % 3] as f32;
    let mut seq = [Complex32::new(0.0, 0.0); PSS_LEN];
    for (n, d) in seq.iter_mut().enumerate() {
        let nf = n as f32;
        // d(n) skips the punctured ZC element at n = 31
        let phase = if n < 31 {
            -PI * u * nf * (nf + 1.0) / 63.0
        } else {
            -PI * u * (nf + 1.0) * (nf + 2.0) / 63.0
        };
        *d = Complex32::from_polar(1.0, phase);
    }
    seq
}

/// First subcarrier of the 62 PSS/SSS subcarriers in a carrier of `nof_prb` PRB
pub fn sync_first_subcarrier(nof_prb: u32) -> usize {
    (nof_prb as usize * 6).saturating_sub(31)
}

/// Write the PSS of `sector_id` into one OFDM symbol of a resource grid
pub fn pss_put_symbol(symbol: &mut [Complex32], nof_prb: u32, sector_id: u8) {
    let k0 = sync_first_subcarrier(nof_prb);
    for (dst, src) in symbol.iter_mut().skip(k0).zip(pss_sequence(sector_id).iter()) {
        *dst = *src;
    }
}

/// FFT bin of element `n` of a 62-element sequence centred on DC
pub fn sync_bin(n: usize, fft_size: usize) -> usize {
    if n < 31 {
        fft_size - 31 + n
    } else {
        n - 30
    }
}

/// Time-domain OFDM symbol (no CP) carrying `seq` around DC, unit-energy scaling
pub(crate) fn sync_symbol_waveform(seq: &[Complex32], fft_size: usize, ifft: &dyn Fft<f32>) -> Vec<Complex32> {
    let mut bins = vec![Complex32::new(0.0, 0.0); fft_size];
    for (n, &v) in seq.iter().enumerate().take(PSS_LEN) {
        bins[sync_bin(n, fft_size)] = v;
    }
    ifft.process(&mut bins);
    let scale = 1.0 / (fft_size as f32).sqrt();
    bins.iter_mut().for_each(|v| *v *= scale);
    bins
}

/// Outcome of one PSS search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PssPeak {
    /// Index one past the end of the PSS symbol in the searched window
    pub position: usize,
    /// Peak-to-side-lobe ratio of the correlation power
    pub psr: f32,
    /// Correlation power at the peak
    pub power: f32,
}

/// Frequency-domain PSS correlator
pub struct PssDetector {
    fft_size: usize,
    max_fft_size: usize,
    max_frame_size: usize,
    corr_size: usize,
    sector: Option<u8>,
    /// Time-domain replica for the current sector and FFT size
    replica: Vec<Complex32>,
    /// Conjugated replica spectra, one per integer CFO hypothesis
    replica_spectra: Vec<Vec<Complex32>>,
    spectrum: Vec<Complex32>,
    corr_power: Vec<f32>,
    scratch: Vec<Complex32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    planner: FftPlanner<f32>,
}

impl PssDetector {
    /// Allocate for windows of up to `max_frame_size` samples and symbols of up to `max_fft_size`
    pub fn new(max_frame_size: usize, max_fft_size: usize) -> Result<Self, PhyError> {
        if max_fft_size < PSS_LEN + 2 || max_frame_size < max_fft_size {
            return Err(PhyError::ConfigurationError(format!(
                "Invalid PSS detector dimensions: frame {} FFT {}",
                max_frame_size, max_fft_size
            )));
        }

        let corr_size = next_power_of_2((max_frame_size + max_fft_size) as u32) as usize;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(corr_size);
        let ifft = planner.plan_fft_inverse(corr_size);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());

        debug!(
            "PSS detector: frame {} FFT {} correlation size {}",
            max_frame_size, max_fft_size, corr_size
        );

        Ok(Self {
            fft_size: max_fft_size,
            max_fft_size,
            max_frame_size,
            corr_size,
            sector: None,
            replica: Vec::with_capacity(max_fft_size),
            replica_spectra: vec![vec![Complex32::new(0.0, 0.0); corr_size]; CFO_I_HYPOTHESES.len()],
            spectrum: vec![Complex32::new(0.0, 0.0); corr_size],
            corr_power: vec![0.0; corr_size],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            fft,
            ifft,
            planner,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sector(&self) -> Option<u8> {
        self.sector
    }

    /// Change the symbol size, keeping the allocation
    pub fn set_fft_size(&mut self, fft_size: usize) -> Result<(), PhyError> {
        if fft_size > self.max_fft_size {
            return Err(PhyError::CapacityExceeded {
                what: "PSS FFT size",
                requested: fft_size,
                capacity: self.max_fft_size,
            });
        }
        if fft_size < PSS_LEN + 2 {
            return Err(PhyError::ConfigurationError(format!("FFT size {} too small for PSS", fft_size)));
        }
        self.fft_size = fft_size;
        if let Some(sector) = self.sector {
            self.build_replicas(sector);
        }
        Ok(())
    }

    /// Select the sector whose PSS is searched
    pub fn set_sector(&mut self, sector_id: u8) -> Result<(), PhyError> {
        if sector_id > 2 {
            return Err(PhyError::ConfigurationError(format!("Invalid sector id {}", sector_id)));
        }
        if self.sector != Some(sector_id) {
            self.build_replicas(sector_id);
            self.sector = Some(sector_id);
        }
        Ok(())
    }

    fn build_replicas(&mut self, sector_id: u8) {
        let n = self.fft_size;
        let ifft = self.planner.plan_fft_inverse(n);
        let waveform = sync_symbol_waveform(&pss_sequence(sector_id), n, ifft.as_ref());
        self.replica.clear();
        self.replica.extend_from_slice(&waveform);

        for (spectrum, &offset) in self.replica_spectra.iter_mut().zip(CFO_I_HYPOTHESES.iter()) {
            spectrum.fill(Complex32::new(0.0, 0.0));
            let step = 2.0 * PI * offset as f32 / n as f32;
            for (i, &v) in waveform.iter().enumerate() {
                spectrum[i] = v * Complex32::from_polar(1.0, step * i as f32);
            }
            self.fft.process_with_scratch(spectrum, &mut self.scratch);
            spectrum.iter_mut().for_each(|v| *v = v.conj());
        }

        debug!("Built PSS replicas for sector {} (FFT {})", sector_id, n);
    }

    /// Unshifted time-domain replica
    pub fn replica(&self) -> &[Complex32] {
        &self.replica
    }

    /// Correlate `input` against the replica of `hypothesis` (index into
    /// [`CFO_I_HYPOTHESES`]) and locate the strongest peak.
    ///
    /// Returns `None` when no sector is set or the window is shorter than one symbol.
    pub fn find(&mut self, input: &[Complex32], hypothesis: usize) -> Option<PssPeak> {
        self.sector?;
        let n = self.fft_size;
        let len = input.len().min(self.max_frame_size);
        if len < n || hypothesis >= self.replica_spectra.len() {
            return None;
        }

        self.spectrum[..len].copy_from_slice(&input[..len]);
        self.spectrum[len..].fill(Complex32::new(0.0, 0.0));
        self.fft.process_with_scratch(&mut self.spectrum, &mut self.scratch);
        for (s, h) in self.spectrum.iter_mut().zip(self.replica_spectra[hypothesis].iter()) {
            *s *= h;
        }
        self.ifft.process_with_scratch(&mut self.spectrum, &mut self.scratch);

        // Lags whose window fits the input
        let valid = len - n + 1;
        let norm = 1.0 / (self.corr_size as f32 * self.corr_size as f32);
        for (p, c) in self.corr_power[..valid].iter_mut().zip(self.spectrum.iter()) {
            *p = c.norm_sqr() * norm;
        }
        let power = &self.corr_power[..valid];

        let (peak, peak_power) = power
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &p)| if p > best.1 { (i, p) } else { best });

        let psr = peak_to_side_lobe(power, peak);
        trace!(
            "PSS hypothesis {} peak at lag {} power {:.3e} PSR {:.2}",
            hypothesis,
            peak,
            peak_power,
            psr
        );

        Some(PssPeak {
            position: peak + n,
            psr,
            power: peak_power,
        })
    }

    /// Fractional CFO in subcarriers from one received PSS symbol (no CP).
    ///
    /// The two halves of the symbol are correlated separately with the replica;
    /// their phase difference is half a symbol of frequency rotation.
    pub fn cfo_compute(&self, symbol: &[Complex32]) -> f32 {
        let n = self.replica.len().min(symbol.len());
        let half = n / 2;
        let y0: Complex32 = symbol[..half]
            .iter()
            .zip(&self.replica[..half])
            .map(|(x, r)| x * r.conj())
            .sum();
        let y1: Complex32 = symbol[half..n]
            .iter()
            .zip(&self.replica[half..n])
            .map(|(x, r)| x * r.conj())
            .sum();
        (y0.conj() * y1).arg() / PI
    }
}

/// Ratio between the peak and the largest value outside its main lobe
fn peak_to_side_lobe(power: &[f32], peak: usize) -> f32 {
    let len = power.len();
    let mut ub = peak + 1;
    while ub + 1 < len && power[ub + 1] <= power[ub] {
        ub += 1;
    }
    let lb = if peak > 2 {
        let mut lb = peak - 1;
        while lb > 1 && power[lb - 1] <= power[lb] {
            lb -= 1;
        }
        lb
    } else {
        0
    };

    let right = power.get(ub..).map_or(0.0, |s| s.iter().copied().fold(0.0, f32::max));
    let left = power[..lb].iter().copied().fold(0.0, f32::max);
    let side = right.max(left);

    if power[peak] <= 0.0 {
        0.0
    } else if side > 0.0 {
        power[peak] / side
    } else {
        f32::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::apply_frequency_shift;

    #[test]
    fn test_pss_is_constant_amplitude() {
        for sector in 0..3 {
            let seq = pss_sequence(sector);
            assert!(seq.iter().all(|v| (v.norm() - 1.0).abs() < 1e-5));
        }
        // d(0) = exp(0) for every root
        assert!((pss_sequence(1)[0] - Complex32::new(1.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn test_sequences_are_nearly_orthogonal() {
        let a = pss_sequence(0);
        let b = pss_sequence(1);
        let cross: Complex32 = a.iter().zip(b.iter()).map(|(x, y)| x * y.conj()).sum();
        assert!(cross.norm() < 0.3 * PSS_LEN as f32);
    }

    #[test]
    fn test_pss_put_symbol_centres_sequence() {
        let mut symbol = vec![Complex32::new(0.0, 0.0); 72];
        pss_put_symbol(&mut symbol, 6, 2);
        assert_eq!(symbol[4], Complex32::new(0.0, 0.0));
        assert_eq!(symbol[5], pss_sequence(2)[0]);
        assert_eq!(symbol[66], pss_sequence(2)[61]);
        assert_eq!(symbol[67], Complex32::new(0.0, 0.0));
    }

    #[test]
    fn test_sync_bins_skip_dc() {
        assert_eq!(sync_bin(0, 128), 97);
        assert_eq!(sync_bin(30, 128), 127);
        assert_eq!(sync_bin(31, 128), 1);
        assert_eq!(sync_bin(61, 128), 31);
    }

    fn frame_with_pss(n: usize, start: usize, len: usize, sector: u8) -> Vec<Complex32> {
        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(n);
        let pss = sync_symbol_waveform(&pss_sequence(sector), n, ifft.as_ref());
        let mut frame = vec![Complex32::new(0.0, 0.0); len];
        frame[start..start + n].copy_from_slice(&pss);
        frame
    }

    #[test]
    fn test_find_locates_symbol_end() {
        let n = 128;
        let frame = frame_with_pss(n, 700, 1920, 1);
        let mut det = PssDetector::new(1920, 128).unwrap();
        assert!(det.find(&frame, 0).is_none());
        det.set_sector(1).unwrap();
        let peak = det.find(&frame, 0).unwrap();
        assert_eq!(peak.position, 700 + n);
        assert!(peak.psr > 3.0, "psr {}", peak.psr);
    }

    #[test]
    fn test_shifted_hypothesis_matches_integer_cfo() {
        let n = 128;
        let mut frame = frame_with_pss(n, 300, 1920, 0);
        apply_frequency_shift(&mut frame, 1.0 / n as f32);
        let mut det = PssDetector::new(1920, 128).unwrap();
        det.set_sector(0).unwrap();
        let powers: Vec<f32> = (0..3).map(|h| det.find(&frame, h).unwrap().power).collect();
        assert!(powers[1] > powers[0] && powers[1] > powers[2], "{:?}", powers);
    }

    #[test]
    fn test_cfo_compute_measures_fraction() {
        let n = 128;
        let mut frame = frame_with_pss(n, 0, n, 2);
        apply_frequency_shift(&mut frame, 0.15 / n as f32);
        let mut det = PssDetector::new(n, n).unwrap();
        det.set_sector(2).unwrap();
        let cfo = det.cfo_compute(&frame);
        assert!((cfo - 0.15).abs() < 0.03, "cfo {}", cfo);
    }

    #[test]
    fn test_fft_size_capacity() {
        let mut det = PssDetector::new(1920, 256).unwrap();
        assert!(det.set_fft_size(128).is_ok());
        assert_eq!(det.fft_size(), 128);
        assert!(matches!(det.set_fft_size(512), Err(PhyError::CapacityExceeded { .. })));
        assert!(det.set_sector(3).is_err());
    }

    #[test]
    fn test_peak_to_side_lobe() {
        let power = [0.1, 0.2, 0.1, 0.5, 4.0, 1.0, 0.3, 0.8, 0.2];
        assert!((peak_to_side_lobe(&power, 4) - 5.0).abs() < 1e-6);
    }
}
