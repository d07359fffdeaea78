pub mod memory;
pub mod sqlite;

pub use memory::MemoryDataStore;
pub use sqlite::SqliteDataStore;
