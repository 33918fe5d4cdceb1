//! Common Utilities and Types Library
//!
//! This crate provides the cell description and numeric helpers shared by the PHY core.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
