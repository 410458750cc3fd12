//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs wrapped in a phantom-typed `Id<T>`: they sort by creation
//! time, can be generated on any node without coordination, and a `TaskId`
//! can never be passed where a `TaskLogId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind. Supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// Serialized as the bare ULID string; displayed with the kind prefix
/// (`task-01J…`). `FromStr` accepts both forms.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid ID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id: {0}")]
pub struct ParseIdError(pub String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

// ========================================
// Marker types
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskMarker {}

impl IdMarker for TaskMarker {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskLogMarker {}

impl IdMarker for TaskLogMarker {
    fn prefix() -> &'static str {
        "log-"
    }
}

/// Identifier of a Task (one unit of deferred work).
pub type TaskId = Id<TaskMarker>;

/// Identifier of a TaskLog row.
pub type TaskLogId = Id<TaskLogMarker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let task = TaskId::from_ulid(Ulid::new());
        let log = TaskLogId::from_ulid(Ulid::new());

        assert!(task.to_string().starts_with("task-"));
        assert!(log.to_string().starts_with("log-"));

        // let _: TaskId = log; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn serializes_as_bare_ulid() {
        let ulid = Ulid::new();
        let id = TaskId::from_ulid(ulid);

        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{ulid}\""));

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parses_with_or_without_prefix() {
        let id = TaskId::from_ulid(Ulid::new());

        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert_eq!(id.as_ulid().to_string().parse::<TaskId>().unwrap(), id);
        assert!("task-nope".parse::<TaskId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<TaskLogId>(), 16);
    }
}
