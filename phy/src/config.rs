//! PHY Configuration Surface
//!
//! TOML-loadable settings for the synchronizer and the channel estimator.
//! Every field has a default so partial documents are accepted.

use crate::PhyError;
use bitflags::bitflags;
use common::types::MAX_PRB;
use serde::{Deserialize, Serialize};

/// Longest smoothing filter, one tap per CRS pilot of the widest carrier
pub const MAX_FILTER_LEN: usize = 2 * MAX_PRB as usize;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PhyConfig {
    /// Synchronizer settings
    #[serde(default)]
    pub sync: SyncConfig,
    /// Channel estimator settings
    #[serde(default)]
    pub chest: EstimatorConfig,
}

impl PhyConfig {
    /// Parse and check a TOML document
    pub fn from_toml_str(doc: &str) -> Result<Self, PhyError> {
        let config: PhyConfig = toml::from_str(doc).map_err(|e| PhyError::Config(e.to_string()))?;
        config.sync.validate()?;
        config.chest.validate()?;
        Ok(config)
    }
}

/// Frame structure hypothesis used during SSS detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameTypeSearch {
    /// Try both FDD and TDD SSS positions and keep the stronger
    Auto,
    Fdd,
    Tdd,
}

/// Synchronizer settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Minimum PSS peak-to-side-lobe ratio, zero accepts any peak
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Smoothing factor of the CFO averages
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f32,
    /// Search the +1/-1 subcarrier integer CFO hypotheses
    #[serde(default)]
    pub cfo_i_enable: bool,
    /// Estimate fractional CFO on the cyclic prefix before PSS search
    #[serde(default = "default_true")]
    pub cfo_cp_enable: bool,
    /// Refine CFO on the two halves of the PSS
    #[serde(default = "default_true")]
    pub cfo_pss_enable: bool,
    /// Symbols averaged by the CP-based CFO estimator
    #[serde(default = "default_cfo_cp_nsymbols")]
    pub cfo_cp_nsymbols: u32,
    /// Detect the SSS after a PSS peak
    #[serde(default = "default_true")]
    pub sss_enable: bool,
    /// Classify the cyclic prefix length
    #[serde(default = "default_true")]
    pub detect_cp: bool,
    /// Frame structure to assume when locating the SSS
    #[serde(default = "default_frame_type")]
    pub frame_type: FrameTypeSearch,
}

fn default_threshold() -> f32 {
    3.0
}

fn default_ema_alpha() -> f32 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_cfo_cp_nsymbols() -> u32 {
    3
}

fn default_frame_type() -> FrameTypeSearch {
    FrameTypeSearch::Fdd
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            ema_alpha: default_ema_alpha(),
            cfo_i_enable: false,
            cfo_cp_enable: true,
            cfo_pss_enable: true,
            cfo_cp_nsymbols: default_cfo_cp_nsymbols(),
            sss_enable: true,
            detect_cp: true,
            frame_type: default_frame_type(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), PhyError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(PhyError::ConfigurationError(format!(
                "Invalid detection threshold {}",
                self.threshold
            )));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(PhyError::ConfigurationError(format!(
                "EMA factor {} outside (0, 1]",
                self.ema_alpha
            )));
        }
        if self.cfo_cp_nsymbols == 0 {
            return Err(PhyError::ConfigurationError(
                "CP CFO estimation needs at least one symbol".to_string(),
            ));
        }
        Ok(())
    }
}

/// Frequency-domain smoothing applied to pilot estimates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    None,
    /// Gaussian taps, `filter_coef = [order, spread factor]`
    Gauss,
    /// Triangular taps, `filter_coef[0]` is the width
    Triangle,
}

/// How pilot symbols are expanded over the subframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorAlgorithm {
    /// Average all pilot symbols and replicate over time
    Average,
    /// Linear interpolation in time between pilot symbols
    Interpolate,
    /// Adaptive frequency-domain Wiener filter, linear in time
    Wiener,
}

/// Noise power estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseAlgorithm {
    PilotDifference,
    Pss,
    EmptySubcarrier,
}

bitflags! {
    /// Set of subframes within a radio frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubframeMask: u16 {
        const SF0 = 1 << 0;
        const SF1 = 1 << 1;
        const SF2 = 1 << 2;
        const SF3 = 1 << 3;
        const SF4 = 1 << 4;
        const SF5 = 1 << 5;
        const SF6 = 1 << 6;
        const SF7 = 1 << 7;
        const SF8 = 1 << 8;
        const SF9 = 1 << 9;
    }
}

impl SubframeMask {
    /// Whether subframe `sf` (0-9) is in the set
    pub fn contains_subframe(&self, sf: usize) -> bool {
        sf < 10 && self.bits() & (1 << sf) != 0
    }
}

impl Default for SubframeMask {
    fn default() -> Self {
        SubframeMask::all()
    }
}

/// Serialized as the raw bitmask
mod mask_bits {
    use super::SubframeMask;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mask: &SubframeMask, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(mask.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SubframeMask, D::Error> {
        let bits = u16::deserialize(deserializer)?;
        Ok(SubframeMask::from_bits_truncate(bits))
    }
}

/// Channel estimator settings, supplied with every subframe
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_filter_type")]
    pub filter_type: FilterType,
    #[serde(default = "default_filter_coef")]
    pub filter_coef: [f32; 2],
    #[serde(default = "default_estimator_alg")]
    pub estimator_alg: EstimatorAlgorithm,
    #[serde(default = "default_noise_alg")]
    pub noise_alg: NoiseAlgorithm,
    /// Estimate CFO from the pilots of the selected subframes
    #[serde(default)]
    pub cfo_estimate_enable: bool,
    #[serde(default, with = "mask_bits")]
    pub cfo_estimate_mask: SubframeMask,
    /// Estimate and correct residual timing error before estimation
    #[serde(default)]
    pub sync_error_enable: bool,
    /// MBSFN area whose pilots are used in MBSFN subframes
    #[serde(default)]
    pub mbsfn_area_id: Option<u16>,
}

fn default_filter_type() -> FilterType {
    FilterType::Gauss
}

fn default_filter_coef() -> [f32; 2] {
    [4.0, 1.0]
}

fn default_estimator_alg() -> EstimatorAlgorithm {
    EstimatorAlgorithm::Interpolate
}

fn default_noise_alg() -> NoiseAlgorithm {
    NoiseAlgorithm::PilotDifference
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            filter_type: default_filter_type(),
            filter_coef: default_filter_coef(),
            estimator_alg: default_estimator_alg(),
            noise_alg: default_noise_alg(),
            cfo_estimate_enable: false,
            cfo_estimate_mask: SubframeMask::all(),
            sync_error_enable: false,
            mbsfn_area_id: None,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), PhyError> {
        if self.filter_coef.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(PhyError::ConfigurationError(format!(
                "Invalid filter coefficients {:?}",
                self.filter_coef
            )));
        }
        if self.filter_coef[0] > MAX_FILTER_LEN as f32 {
            return Err(PhyError::ConfigurationError(format!(
                "Filter length {} exceeds {} pilots",
                self.filter_coef[0], MAX_FILTER_LEN
            )));
        }
        Ok(())
    }
}
