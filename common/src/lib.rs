//! Shared data model for hostwatch.
//!
//! This crate provides:
//! - Host addresses and their network classification
//! - The per-host record, including its field-by-field merge rules
//! - Probe snapshots and app catalog wire types
#![cfg_attr(
    test,
    expect(clippy::unwrap_used, reason = "This is not problematic in tests")
)]

extern crate alloc;
extern crate core;

mod address;
mod protocol;
mod record;

pub use address::*;
pub use protocol::*;
pub use record::*;
