//! Task store implementations

pub mod memory;
pub mod task;

pub use memory::MemoryTaskStore;
pub use task::TaskRepository;
