//! Counter store implementations.

mod memory;
mod postgres;

pub use memory::MemoryCounterStore;
pub use postgres::{PostgresCounterStore, INCREMENT_FUNCTION, SCHEMA};
