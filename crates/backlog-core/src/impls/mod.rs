//! TaskStore implementations.
//!
//! - `memory`: single-process store for tests, demos and local runs
//! - `postgres`: durable store on PostgreSQL (feature `postgres`)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use self::memory::InMemoryTaskStore;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresTaskStore;
