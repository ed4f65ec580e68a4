use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds on the naive local clock, the only time type.
///
/// A naive local timestamp is encoded as if it were UTC; no timezone
/// arithmetic ever happens on these values.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict overlap: spans that merely touch do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub mobile: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub title: String,
    pub span: Span,
    pub description: Option<String>,
    /// Allocation ids held by this event, in allocation order.
    pub allocations: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
}

/// One allocation as seen from its resource: the event's interval is copied
/// here so conflict scans never leave the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub allocation_id: Ulid,
    pub event_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    /// Free-form category tag (room, instructor, equipment, ...).
    pub kind: String,
    /// Bookings sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, kind: String) -> Self {
        Self {
            id,
            name,
            kind,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove booking by allocation id.
    pub fn remove_booking(&mut self, allocation_id: Ulid) -> Option<Booking> {
        let pos = self
            .bookings
            .iter()
            .position(|b| b.allocation_id == allocation_id)?;
        Some(self.bookings.remove(pos))
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The change types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    UserRegistered {
        id: Ulid,
        username: String,
    },
    ProfileUpdated {
        id: Ulid,
        username: String,
        mobile: Option<String>,
        address: Option<String>,
    },
    ResourceCreated {
        id: Ulid,
        name: String,
        kind: String,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        kind: String,
    },
    EventCreated {
        id: Ulid,
        owner_id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    },
    EventUpdated {
        id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    },
    /// Cascades: the event's allocations go with it.
    EventDeleted {
        id: Ulid,
    },
    ResourceAllocated {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
    },
    ResourceDeallocated {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub username: String,
    pub mobile: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    pub description: Option<String>,
}

/// An allocation joined with its event's title and interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
    pub event_title: String,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUtilization {
    pub resource_id: Ulid,
    pub name: String,
    pub kind: String,
    /// Rounded to two decimal places.
    pub total_hours_utilized: f64,
    pub upcoming: Vec<EventInfo>,
}

impl From<&User> for UserInfo {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            mobile: u.mobile.clone(),
            address: u.address.clone(),
        }
    }
}

impl From<&ResourceState> for ResourceInfo {
    fn from(rs: &ResourceState) -> Self {
        Self {
            id: rs.id,
            name: rs.name.clone(),
            kind: rs.kind.clone(),
        }
    }
}

impl From<&Event> for EventInfo {
    fn from(e: &Event) -> Self {
        Self {
            id: e.id,
            owner_id: e.owner_id,
            title: e.title.clone(),
            start: e.span.start,
            end: e.span.end,
            description: e.description.clone(),
        }
    }
}
