//! # commitvault
//!
//! Re-exports [`commitvault_core`], the embedded version-control core.
//! The `cvault` command-line driver lives in the `commitvault-cli` crate.

pub use commitvault_core::*;
