pub mod storage;

pub use storage::{MemoryBackend, MemoryConnection};
