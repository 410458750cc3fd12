//! Ports: the seams to the outside world.
//!
//! Each trait hides an external dependency (the durable store, time, id
//! generation) so services can be wired with in-memory versions in tests and
//! real ones in production.

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{CasOutcome, TaskCounts, TaskStore};
