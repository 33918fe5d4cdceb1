//! LTE PHY Synchronization and Channel Estimation Core
//!
//! This crate acquires timing and frequency synchronization to an LTE cell and
//! estimates the downlink radio channel from the cell-specific reference signals.

pub mod chest;
pub mod config;
pub mod ema;
pub mod interp;
pub mod refsignal;
pub mod sync;

pub use chest::{ChannelEstimateResult, ChannelEstimator, SubframeConfig, SubframeType};
pub use config::{EstimatorAlgorithm, EstimatorConfig, FilterType, NoiseAlgorithm, PhyConfig, SubframeMask, SyncConfig};
pub use refsignal::{MbsfnSignalSet, ReferenceSignalSet};
pub use sync::{FindResult, FrameTypeSearch, SyncPhase, Synchronizer};

use thiserror::Error;

/// Errors raised by the PHY core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhyError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Capacity exceeded: {what} requested {requested}, allocated {capacity}")]
    CapacityExceeded {
        what: &'static str,
        requested: usize,
        capacity: usize,
    },

    #[error("Invalid configuration document: {0}")]
    Config(String),
}
