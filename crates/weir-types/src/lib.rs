//! Pure data types for weir: process ids, lifecycle states, status rows.
//!
//! This crate is a leaf dependency with no async runtime and no I/O, so that
//! embedders can consume status snapshots without pulling in the kernel.

pub mod process;

pub use process::*;
