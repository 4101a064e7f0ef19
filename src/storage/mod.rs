pub mod engine;
pub mod memory;
pub mod persistence;

pub use engine::LifecycleStore;
pub use memory::InMemoryLifecycleStore;
pub use persistence::FileLifecycleStore;
