//! Secondary Synchronization Signal
//!
//! LTE SSS generation and detection (3GPP TS 36.211 Section 6.11.2). Detection
//! equalizes the SSS with the channel seen on the PSS and recovers the pair of
//! m-sequence shifts (m0, m1), which identify the cell group and the half frame.

use super::pss::{pss_sequence, sync_bin, sync_symbol_waveform, PSS_LEN};
use crate::PhyError;
use common::types::Pci;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::{debug, trace};

/// SSS sequence length (subcarriers)
pub const SSS_LEN: usize = 62;

/// Length of each interleaved m-sequence half
const N: usize = 31;

/// Required ratio between the sf0 and sf5 hypotheses when the group is known
pub const KNOWN_GROUP_RATIO: f32 = 1.2;

/// Length-31 +/-1 sequence of the m-sequence with feedback taps `taps`
fn m_sequence(taps: &[usize]) -> [f32; N] {
    let mut x = [0u8; N];
    x[4] = 1;
    for i in 0..N - 5 {
        x[i + 5] = taps.iter().fold(0, |acc, &t| acc ^ x[i + t]);
    }
    let mut seq = [0.0f32; N];
    for (s, &b) in seq.iter_mut().zip(x.iter()) {
        *s = 1.0 - 2.0 * b as f32;
    }
    seq
}

/// The three base sequences s~, c~ and z~
struct BaseSequences {
    s: [f32; N],
    c: [f32; N],
    z: [f32; N],
}

impl BaseSequences {
    fn new() -> Self {
        Self {
            // x(i+5) = x(i+2) + x(i)
            s: m_sequence(&[0, 2]),
            // x(i+5) = x(i+3) + x(i)
            c: m_sequence(&[0, 3]),
            // x(i+5) = x(i+4) + x(i+2) + x(i+1) + x(i)
            z: m_sequence(&[0, 1, 2, 4]),
        }
    }
}

/// (m0, m1) pair of cell group `group_id`
pub fn m0_m1(group_id: u16) -> (usize, usize) {
    let n1 = group_id as usize;
    let q_prime = n1 / 30;
    let q = (n1 + q_prime * (q_prime + 1) / 2) / 30;
    let m_prime = n1 + q * (q + 1) / 2;
    let m0 = m_prime % N;
    let m1 = (m0 + m_prime / N + 1) % N;
    (m0, m1)
}

/// SSS of `pci` for the first (subframe 0) or second (subframe 5) half frame
pub fn sss_sequence(pci: Pci, subframe5: bool) -> [f32; SSS_LEN] {
    let base = BaseSequences::new();
    let (m0, m1) = m0_m1(pci.group_id());
    let nid2 = pci.sector_id() as usize;

    let mut d = [0.0f32; SSS_LEN];
    for n in 0..N {
        let s0 = base.s[(n + m0) % N];
        let s1 = base.s[(n + m1) % N];
        let c0 = base.c[(n + nid2) % N];
        let c1 = base.c[(n + nid2 + 3) % N];
        let z1_m0 = base.z[(n + m0 % 8) % N];
        let z1_m1 = base.z[(n + m1 % 8) % N];
        if subframe5 {
            d[2 * n] = s1 * c0;
            d[2 * n + 1] = s0 * c1 * z1_m1;
        } else {
            d[2 * n] = s0 * c0;
            d[2 * n + 1] = s1 * c1 * z1_m0;
        }
    }
    d
}

/// Write the SSS into one OFDM symbol of a resource grid
pub fn sss_put_symbol(symbol: &mut [Complex32], nof_prb: u32, pci: Pci, subframe5: bool) {
    let k0 = super::pss::sync_first_subcarrier(nof_prb);
    for (dst, &src) in symbol.iter_mut().skip(k0).zip(sss_sequence(pci, subframe5).iter()) {
        *dst = Complex32::new(src, 0.0);
    }
}

/// Result of an SSS search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SssDetection {
    /// Cell group id (N_id_1)
    pub group_id: u16,
    /// Whether the SSS belongs to the second half frame
    pub subframe5: bool,
    /// Confidence of the detection (best over runner-up correlation)
    pub ratio: f32,
}

/// SSS detector working on FFT-demodulated PSS and SSS symbols
pub struct SssDetector {
    fft_size: usize,
    max_fft_size: usize,
    sector: Option<u8>,
    base: BaseSequences,
    /// Group id of every (m0, m1) pair with m0 < m1
    group_table: Vec<Option<u16>>,
    /// Time-domain SSS symbols of a known group for subframes 0 and 5
    known: Option<(u16, [Vec<Complex32>; 2])>,
    pss_bins: Vec<Complex32>,
    sss_bins: Vec<Complex32>,
    scratch: Vec<Complex32>,
    fft: Arc<dyn Fft<f32>>,
    planner: FftPlanner<f32>,
}

impl SssDetector {
    pub fn new(max_fft_size: usize) -> Result<Self, PhyError> {
        if max_fft_size < SSS_LEN + 2 {
            return Err(PhyError::ConfigurationError(format!(
                "FFT size {} too small for SSS",
                max_fft_size
            )));
        }

        let mut group_table = vec![None; N * N];
        for group in 0..Pci::NOF_GROUPS {
            let (m0, m1) = m0_m1(group);
            group_table[m0 * N + m1] = Some(group);
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(max_fft_size);
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Ok(Self {
            fft_size: max_fft_size,
            max_fft_size,
            sector: None,
            base: BaseSequences::new(),
            group_table,
            known: None,
            pss_bins: vec![Complex32::new(0.0, 0.0); max_fft_size],
            sss_bins: vec![Complex32::new(0.0, 0.0); max_fft_size],
            scratch,
            fft,
            planner,
        })
    }

    pub fn set_fft_size(&mut self, fft_size: usize) -> Result<(), PhyError> {
        if fft_size > self.max_fft_size {
            return Err(PhyError::CapacityExceeded {
                what: "SSS FFT size",
                requested: fft_size,
                capacity: self.max_fft_size,
            });
        }
        if fft_size != self.fft_size {
            self.fft_size = fft_size;
            self.fft = self.planner.plan_fft_forward(fft_size);
            let scratch_len = self.fft.get_inplace_scratch_len();
            self.scratch.resize(scratch_len, Complex32::new(0.0, 0.0));
            if let Some((group, _)) = self.known {
                self.set_group_id(Some(group))?;
            }
        }
        Ok(())
    }

    pub fn set_sector(&mut self, sector_id: u8) -> Result<(), PhyError> {
        if sector_id > 2 {
            return Err(PhyError::ConfigurationError(format!("Invalid sector id {}", sector_id)));
        }
        self.sector = Some(sector_id);
        if let Some((group, _)) = self.known {
            self.set_group_id(Some(group))?;
        }
        Ok(())
    }

    /// Use a previously detected group for the simplified check, `None` for full search
    pub fn set_group_id(&mut self, group_id: Option<u16>) -> Result<(), PhyError> {
        let (group, sector) = match (group_id, self.sector) {
            (None, _) => {
                self.known = None;
                return Ok(());
            }
            (Some(g), _) if g >= Pci::NOF_GROUPS => {
                return Err(PhyError::ConfigurationError(format!("Invalid group id {}", g)));
            }
            (Some(g), Some(s)) => (g, s),
            // The waveforms are built once the sector is known
            (Some(g), None) => {
                self.known = Some((g, [Vec::new(), Vec::new()]));
                return Ok(());
            }
        };

        let pci = Pci(3 * group + sector as u16);
        let ifft = self.planner.plan_fft_inverse(self.fft_size);
        let waveform = |sf5: bool| {
            let seq: Vec<Complex32> = sss_sequence(pci, sf5).iter().map(|&v| Complex32::new(v, 0.0)).collect();
            sync_symbol_waveform(&seq, self.fft_size, ifft.as_ref())
        };
        let waveforms = [waveform(false), waveform(true)];
        self.known = Some((group, waveforms));
        debug!("SSS waveforms prepared for group {} (PCI {})", group, pci.0);
        Ok(())
    }

    pub fn known_group(&self) -> Option<u16> {
        self.known.as_ref().map(|(g, _)| *g)
    }

    /// Full search over all groups.
    ///
    /// `pss_symbol` and `sss_symbol` are the time-domain symbols without CP.
    pub fn detect(&mut self, pss_symbol: &[Complex32], sss_symbol: &[Complex32]) -> Option<SssDetection> {
        let sector = self.sector? as usize;
        let n = self.fft_size;
        if pss_symbol.len() < n || sss_symbol.len() < n {
            return None;
        }

        self.pss_bins[..n].copy_from_slice(&pss_symbol[..n]);
        self.sss_bins[..n].copy_from_slice(&sss_symbol[..n]);
        self.fft.process_with_scratch(&mut self.pss_bins[..n], &mut self.scratch);
        self.fft.process_with_scratch(&mut self.sss_bins[..n], &mut self.scratch);

        // Equalize the SSS with the channel seen on the PSS
        let pss = pss_sequence(sector as u8);
        let mut y = [Complex32::new(0.0, 0.0); SSS_LEN];
        for (i, v) in y.iter_mut().enumerate().take(PSS_LEN) {
            let bin = sync_bin(i, n);
            let h = self.pss_bins[bin] * pss[i].conj();
            *v = self.sss_bins[bin] * h.conj();
        }

        // Even half: s_a(n) c0(n)
        let mut even = [Complex32::new(0.0, 0.0); N];
        for (i, e) in even.iter_mut().enumerate() {
            *e = y[2 * i] * self.base.c[(i + sector) % N];
        }
        let (m_a, p_a, s_a) = self.best_shift(&even);

        // Odd half: s_b(n) c1(n) z1^(m_a)(n)
        let mut odd = [Complex32::new(0.0, 0.0); N];
        for (i, o) in odd.iter_mut().enumerate() {
            *o = y[2 * i + 1] * self.base.c[(i + sector + 3) % N] * self.base.z[(i + m_a % 8) % N];
        }
        let (m_b, p_b, s_b) = self.best_shift(&odd);

        let (subframe5, m0, m1) = if m_a < m_b { (false, m_a, m_b) } else { (true, m_b, m_a) };
        let group_id = self.group_table[m0 * N + m1]?;
        let ratio = if s_a + s_b > 0.0 {
            (p_a + p_b) / (s_a + s_b)
        } else {
            f32::INFINITY
        };

        trace!(
            "SSS m_a={} m_b={} group {} sf{} ratio {:.2}",
            m_a,
            m_b,
            group_id,
            if subframe5 { 5 } else { 0 },
            ratio
        );

        Some(SssDetection {
            group_id,
            subframe5,
            ratio,
        })
    }

    /// Shift of s~ best matching `x`, with its correlation and the runner-up
    fn best_shift(&self, x: &[Complex32; N]) -> (usize, f32, f32) {
        let mut best = (0, 0.0f32);
        let mut second = 0.0f32;
        for m in 0..N {
            let corr: Complex32 = x
                .iter()
                .enumerate()
                .map(|(i, v)| v * self.base.s[(i + m) % N])
                .sum();
            let mag = corr.norm();
            if mag > best.1 {
                second = best.1;
                best = (m, mag);
            } else if mag > second {
                second = mag;
            }
        }
        (best.0, best.1, second)
    }

    /// Check a time-domain SSS symbol against the known group's two waveforms.
    ///
    /// Returns the detection when one half frame beats the other by [`KNOWN_GROUP_RATIO`].
    pub fn detect_known(&self, sss_symbol: &[Complex32]) -> Option<SssDetection> {
        let (group_id, waveforms) = self.known.as_ref()?;
        let n = self.fft_size;
        if sss_symbol.len() < n || waveforms[0].len() != n {
            return None;
        }

        let corr = |w: &[Complex32]| -> f32 {
            sss_symbol[..n]
                .iter()
                .zip(w)
                .map(|(x, r)| x * r.conj())
                .sum::<Complex32>()
                .norm()
        };
        let c0 = corr(&waveforms[0]);
        let c5 = corr(&waveforms[1]);
        if c0.max(c5) <= 0.0 {
            return None;
        }

        let (subframe5, ratio) = if c0 >= c5 {
            (false, if c5 > 0.0 { c0 / c5 } else { f32::INFINITY })
        } else {
            (true, if c0 > 0.0 { c5 / c0 } else { f32::INFINITY })
        };

        trace!("Known-group SSS sf0 {:.3e} sf5 {:.3e} ratio {:.2}", c0, c5, ratio);

        if ratio > KNOWN_GROUP_RATIO {
            Some(SssDetection {
                group_id: *group_id,
                subframe5,
                ratio,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(pci: Pci, subframe5: bool, n: usize) -> (Vec<Complex32>, Vec<Complex32>) {
        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(n);
        let pss = sync_symbol_waveform(&pss_sequence(pci.sector_id()), n, ifft.as_ref());
        let sss: Vec<Complex32> = sss_sequence(pci, subframe5)
            .iter()
            .map(|&v| Complex32::new(v, 0.0))
            .collect();
        (pss, sync_symbol_waveform(&sss, n, ifft.as_ref()))
    }

    #[test]
    fn test_m0_m1_table() {
        assert_eq!(m0_m1(0), (0, 1));
        assert_eq!(m0_m1(29), (29, 30));
        assert_eq!(m0_m1(30), (0, 2));
        assert_eq!(m0_m1(167), (2, 9));
        for g in 0..Pci::NOF_GROUPS {
            let (m0, m1) = m0_m1(g);
            assert!(m0 < m1, "group {} gives ({}, {})", g, m0, m1);
        }
    }

    #[test]
    fn test_sss_halves_differ() {
        let a = sss_sequence(Pci(10), false);
        let b = sss_sequence(Pci(10), true);
        assert!(a.iter().all(|v| v.abs() == 1.0));
        assert_ne!(a, b);
        // Even elements swap s0 and s1 between the halves
        assert_ne!(a[0..2], b[0..2]);
    }

    #[test]
    fn test_detect_recovers_group_and_half() {
        let n = 128;
        let mut det = SssDetector::new(n).unwrap();
        for &(id, sf5) in &[(1u16, false), (301, true), (503, false), (77, true)] {
            let pci = Pci(id);
            det.set_sector(pci.sector_id()).unwrap();
            let (pss, sss) = symbols(pci, sf5, n);
            let found = det.detect(&pss, &sss).unwrap();
            assert_eq!(found.group_id, pci.group_id());
            assert_eq!(found.subframe5, sf5);
            assert!(found.ratio > 2.0);
        }
    }

    #[test]
    fn test_detect_tolerates_channel_phase() {
        let n = 256;
        let pci = Pci(44);
        let mut det = SssDetector::new(n).unwrap();
        det.set_sector(pci.sector_id()).unwrap();
        let (pss, sss) = symbols(pci, false, n);
        let rot = Complex32::from_polar(0.5, 1.1);
        let pss: Vec<Complex32> = pss.iter().map(|v| v * rot).collect();
        let sss: Vec<Complex32> = sss.iter().map(|v| v * rot).collect();
        assert_eq!(det.detect(&pss, &sss).unwrap().group_id, pci.group_id());
    }

    #[test]
    fn test_known_group_check() {
        let n = 128;
        let pci = Pci(200);
        let mut det = SssDetector::new(n).unwrap();
        det.set_sector(pci.sector_id()).unwrap();
        det.set_group_id(Some(pci.group_id())).unwrap();
        assert_eq!(det.known_group(), Some(pci.group_id()));

        let (_, sss5) = symbols(pci, true, n);
        let found = det.detect_known(&sss5).unwrap();
        assert!(found.subframe5);
        assert!(found.ratio > KNOWN_GROUP_RATIO);

        // Silence gives no decision
        assert!(det.detect_known(&vec![Complex32::new(0.0, 0.0); n]).is_none());
        assert!(det.set_group_id(Some(168)).is_err());
    }
}
