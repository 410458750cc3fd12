//! IdGenerator port.
//!
//! IDs are ULIDs whose timestamp part comes from the injected `Clock`, so a
//! `FixedClock` in tests yields IDs with a known time component.

use ulid::Ulid;

use crate::domain::ids::{TaskId, TaskLogId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_log_id(&self) -> TaskLogId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_log_id(&self) -> TaskLogId {
        TaskLogId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_uses_clock_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_log_id();

        // random part differs, timestamp part does not
        assert_ne!(id1.as_ulid(), id2.as_ulid());
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
