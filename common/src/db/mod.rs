// Database layer module

pub mod memory;
pub mod pool;
pub mod repositories;
pub mod store;

pub use memory::InMemoryTaskStore;
pub use pool::DbPool;
pub use repositories::TaskRepository;
pub use store::TaskStore;
