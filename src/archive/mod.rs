//! Snapshots, cold storage, and the background archive sweep.

mod cold;
mod manager;
mod runner;

pub use cold::{ColdStore, FileColdStore, MemoryColdStore};
pub use manager::{ArchiveManager, SweepReport};
pub use runner::ArchiveRunner;
