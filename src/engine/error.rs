use ulid::Ulid;

use crate::model::{AllocationInfo, Ms};
use crate::timefmt::format_timestamp;

#[derive(Debug)]
pub enum EngineError {
    /// `start >= end`.
    InvalidInterval { start: Ms, end: Ms },
    InvalidTimestamp(String),
    /// Requester does not own the event.
    Unauthorized { event_id: Ulid, user_id: Ulid },
    /// Every allocation on `resource_id` the proposed interval would overlap.
    ResourceConflict {
        resource_id: Ulid,
        conflicts: Vec<AllocationInfo>,
    },
    /// Ledger-level rejection of a second (event, resource) pair.
    DuplicateAllocation { event_id: Ulid, resource_id: Ulid },
    /// Allocation request for a pair that already exists; nothing changed.
    AlreadyAllocated { event_id: Ulid, resource_id: Ulid },
    /// Reference to a user, event, resource or allocation that does not exist.
    ReferentialError(Ulid),
    AlreadyExists(Ulid),
    NameTaken(String),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Informational outcomes that signal a no-op rather than a failure.
    pub fn is_noop(&self) -> bool {
        matches!(self, EngineError::AlreadyAllocated { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => write!(
                f,
                "invalid interval: start {} must be before end {}",
                format_timestamp(*start),
                format_timestamp(*end)
            ),
            EngineError::InvalidTimestamp(s) => {
                write!(f, "invalid timestamp '{s}': expected YYYY-MM-DDTHH:MM")
            }
            EngineError::Unauthorized { event_id, user_id } => {
                write!(f, "user {user_id} is not authorized to modify event {event_id}")
            }
            EngineError::ResourceConflict {
                resource_id,
                conflicts,
            } => {
                write!(f, "conflict on resource {resource_id}: already booked by")?;
                for (i, c) in conflicts.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(
                        f,
                        "{sep}{} ({} to {})",
                        c.event_title,
                        format_timestamp(c.start),
                        format_timestamp(c.end)
                    )?;
                }
                Ok(())
            }
            EngineError::DuplicateAllocation {
                event_id,
                resource_id,
            } => write!(
                f,
                "duplicate allocation: resource {resource_id} already held by event {event_id}"
            ),
            EngineError::AlreadyAllocated {
                event_id,
                resource_id,
            } => write!(
                f,
                "resource {resource_id} already allocated to event {event_id}"
            ),
            EngineError::ReferentialError(id) => write!(f, "referenced entity not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NameTaken(name) => write!(f, "name already taken: {name}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
