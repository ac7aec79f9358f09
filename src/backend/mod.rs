//! Persistence backends.

mod file;
mod kv;
mod memory;

pub use file::FileBackend;
pub use kv::{keys, KvBackend};
pub use memory::MemoryBackend;
