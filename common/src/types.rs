//! Common Types for the LTE PHY Core
//!
//! Defines the cell-level vocabulary shared by the synchronizer and the channel estimator

use serde::{Deserialize, Serialize};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Subcarriers per resource block
pub const NRE: usize = 12;

/// Largest resource block count of an LTE carrier
pub const MAX_PRB: u32 = 110;

/// Smallest resource block count of an LTE carrier
pub const MIN_PRB: u32 = 6;

/// Subframes per radio frame
pub const NOF_SUBFRAMES: usize = 10;

/// Slots per radio frame
pub const NOF_SLOTS: usize = 20;

/// Maximum number of transmit antenna ports carrying cell-specific pilots
pub const MAX_PORTS: usize = 4;

/// LTE subcarrier spacing in Hz
pub const SUBCARRIER_SPACING_HZ: f32 = 15_000.0;

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-503)
    pub const MAX: u16 = 503;

    /// Number of cell groups (N_id_1 range)
    pub const NOF_GROUPS: u16 = 168;

    /// Number of sectors per group (N_id_2 range)
    pub const NOF_SECTORS: u8 = 3;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Compose a PCI from its group id (N_id_1) and sector id (N_id_2)
    pub fn from_parts(group_id: u16, sector_id: u8) -> Option<Self> {
        if group_id < Self::NOF_GROUPS && sector_id < Self::NOF_SECTORS {
            Some(Self(3 * group_id + sector_id as u16))
        } else {
            None
        }
    }

    /// Cell group id (N_id_1, 0-167)
    pub fn group_id(&self) -> u16 {
        self.0 / 3
    }

    /// Sector id within the group (N_id_2, 0-2)
    pub fn sector_id(&self) -> u8 {
        (self.0 % 3) as u8
    }

    /// Frequency shift of the cell-specific pilots
    pub fn pilot_shift(&self) -> usize {
        (self.0 % 6) as usize
    }
}

/// Cyclic prefix type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclicPrefix {
    Normal,
    Extended,
}

impl CyclicPrefix {
    /// OFDM symbols per slot
    pub fn symbols_per_slot(&self) -> usize {
        match self {
            CyclicPrefix::Normal => 7,
            CyclicPrefix::Extended => 6,
        }
    }

    /// OFDM symbols per subframe
    pub fn symbols_per_subframe(&self) -> usize {
        2 * self.symbols_per_slot()
    }

    /// CP length in samples of the given symbol within a slot
    pub fn len(&self, symbol_in_slot: usize, fft_size: usize) -> usize {
        match self {
            CyclicPrefix::Normal => cp_len_norm(symbol_in_slot, fft_size),
            CyclicPrefix::Extended => cp_len_ext(fft_size),
        }
    }

    /// CP length of the symbols that are not first in a slot
    pub fn nominal_len(&self, fft_size: usize) -> usize {
        self.len(1, fft_size)
    }

    /// Subframe length in samples
    pub fn subframe_len(&self, fft_size: usize) -> usize {
        (0..self.symbols_per_subframe())
            .map(|l| fft_size + self.len(l % self.symbols_per_slot(), fft_size))
            .sum()
    }
}

/// Normal CP length: 160/2048 for the first symbol of a slot, 144/2048 otherwise
pub fn cp_len_norm(symbol_in_slot: usize, fft_size: usize) -> usize {
    if symbol_in_slot == 0 {
        160 * fft_size / 2048
    } else {
        144 * fft_size / 2048
    }
}

/// Extended CP length: 512/2048 of the FFT size
pub fn cp_len_ext(fft_size: usize) -> usize {
    512 * fft_size / 2048
}

/// Duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplexMode {
    /// Frequency Division Duplex
    Fdd,
    /// Time Division Duplex
    Tdd,
}

/// Standard LTE channel bandwidths, discriminant is the resource block count
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 1.4 MHz
    Bw1_4 = 6,
    /// 3 MHz
    Bw3 = 15,
    /// 5 MHz
    Bw5 = 25,
    /// 10 MHz
    Bw10 = 50,
    /// 15 MHz
    Bw15 = 75,
    /// 20 MHz
    Bw20 = 100,
}

impl Bandwidth {
    /// Look up a standard bandwidth from its resource block count
    pub fn from_nof_prb(nof_prb: u32) -> Option<Self> {
        Self::from_u32(nof_prb)
    }

    /// Number of resource blocks
    pub fn nof_prb(&self) -> u32 {
        *self as u32
    }

    /// FFT size used to demodulate this bandwidth
    pub fn fft_size(&self) -> usize {
        match self {
            Bandwidth::Bw1_4 => 128,
            Bandwidth::Bw3 => 256,
            Bandwidth::Bw5 => 512,
            Bandwidth::Bw10 => 1024,
            Bandwidth::Bw15 => 1536,
            Bandwidth::Bw20 => 2048,
        }
    }

    /// Get the sample rate for this bandwidth
    pub fn to_sample_rate(&self) -> f64 {
        self.fft_size() as f64 * SUBCARRIER_SPACING_HZ as f64
    }
}

/// Static description of the cell being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDescriptor {
    /// Physical cell identity
    pub pci: Pci,
    /// Number of downlink resource blocks
    pub nof_prb: u32,
    /// Cyclic prefix length
    pub cp: CyclicPrefix,
    /// Number of transmit antenna ports (1, 2 or 4)
    pub nof_ports: u32,
    /// Frame structure
    pub duplex: DuplexMode,
}

impl CellDescriptor {
    /// Check the descriptor, returning the reason when it is unusable
    pub fn validate(&self) -> Result<(), String> {
        if self.pci.0 > Pci::MAX {
            return Err(format!("PCI {} out of range (max {})", self.pci.0, Pci::MAX));
        }
        if self.nof_prb < MIN_PRB || self.nof_prb > MAX_PRB {
            return Err(format!("Invalid number of PRB {} (valid {}-{})", self.nof_prb, MIN_PRB, MAX_PRB));
        }
        if !matches!(self.nof_ports, 1 | 2 | 4) {
            return Err(format!("Invalid number of ports {}", self.nof_ports));
        }
        Ok(())
    }

    /// Subcarriers across the carrier
    pub fn nof_subcarriers(&self) -> usize {
        self.nof_prb as usize * NRE
    }

    /// Resource elements in one subframe
    pub fn nof_re(&self) -> usize {
        self.nof_subcarriers() * self.cp.symbols_per_subframe()
    }
}
