//! Persistence layer for task records.

pub mod memory;
pub mod traits;

pub use memory::MemoryTaskStore;
pub use traits::TaskStore;
