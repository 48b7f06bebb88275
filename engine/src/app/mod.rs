//! The polling engine: address races, per-host sessions, catalog pollers and
//! the registry tying them together.

mod catalog;
mod context;
mod entry;
mod race;
mod registry;
mod session;

pub use catalog::{CatalogVerdict, EmptyCatalogTracker};
pub use context::Collaborators;
pub use race::{RaceOutcome, RaceSettings, race_addresses};
pub use registry::{HostRegistry, NetworkChange, RegistryError};
