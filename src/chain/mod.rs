//! Append-only version chain storage.

mod journal;
mod store;

pub use journal::{CommitJournal, JournalEntry};
pub use store::{AppendOutcome, ArchiveStub, ChainStore, History};
