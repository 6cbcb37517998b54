pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryStore;
pub use postgres::PostgresStorage;
pub use traits::{ChildLimits, CommitReceipt, IterationWrites, MessageWrite, Storage};
