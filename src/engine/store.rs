use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// The authoritative ledger of one tenant: users, resources, events and the
/// allocations binding events to resources.
///
/// Uniqueness and referential invariants are enforced here. Conflict-freedom
/// is not: that is decided by the oracle before a change reaches the ledger.
/// The ledger is not synchronized; the engine serializes access to it.
#[derive(Debug, Default)]
pub struct Ledger {
    users: BTreeMap<Ulid, User>,
    usernames: HashMap<String, Ulid>,
    resources: BTreeMap<Ulid, ResourceState>,
    resource_names: HashMap<String, Ulid>,
    events: BTreeMap<Ulid, Event>,
    allocations: BTreeMap<Ulid, Allocation>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user(&self, id: &Ulid) -> Option<&User> {
        self.users.get(id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn username_owner(&self, username: &str) -> Option<Ulid> {
        self.usernames.get(username).copied()
    }

    pub fn insert_user(&mut self, id: Ulid, username: String) -> Result<(), EngineError> {
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.usernames.contains_key(&username) {
            return Err(EngineError::NameTaken(username));
        }
        self.usernames.insert(username.clone(), id);
        self.users.insert(
            id,
            User {
                id,
                username,
                mobile: None,
                address: None,
            },
        );
        Ok(())
    }

    pub fn update_profile(
        &mut self,
        id: Ulid,
        username: String,
        mobile: Option<String>,
        address: Option<String>,
    ) -> Result<(), EngineError> {
        if self.username_owner(&username).is_some_and(|owner| owner != id) {
            return Err(EngineError::NameTaken(username));
        }
        let user = self
            .users
            .get_mut(&id)
            .ok_or(EngineError::ReferentialError(id))?;
        if user.username != username {
            self.usernames.remove(&user.username);
            self.usernames.insert(username.clone(), id);
            user.username = username;
        }
        user.mobile = mobile;
        user.address = address;
        Ok(())
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource(&self, id: &Ulid) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.values()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn resource_name_owner(&self, name: &str) -> Option<Ulid> {
        self.resource_names.get(name).copied()
    }

    pub fn insert_resource(&mut self, id: Ulid, name: String, kind: String) -> Result<(), EngineError> {
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.resource_names.contains_key(&name) {
            return Err(EngineError::NameTaken(name));
        }
        self.resource_names.insert(name.clone(), id);
        self.resources.insert(id, ResourceState::new(id, name, kind));
        Ok(())
    }

    pub fn update_resource(&mut self, id: Ulid, name: String, kind: String) -> Result<(), EngineError> {
        if self.resource_name_owner(&name).is_some_and(|owner| owner != id) {
            return Err(EngineError::NameTaken(name));
        }
        let rs = self
            .resources
            .get_mut(&id)
            .ok_or(EngineError::ReferentialError(id))?;
        if rs.name != name {
            self.resource_names.remove(&rs.name);
            self.resource_names.insert(name.clone(), id);
            rs.name = name;
        }
        rs.kind = kind;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────

    pub fn event(&self, id: &Ulid) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn insert_event(
        &mut self,
        id: Ulid,
        owner_id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    ) -> Result<(), EngineError> {
        if self.events.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.users.contains_key(&owner_id) {
            return Err(EngineError::ReferentialError(owner_id));
        }
        self.events.insert(
            id,
            Event {
                id,
                owner_id,
                title,
                span,
                description,
                allocations: Vec::new(),
            },
        );
        Ok(())
    }

    /// Replace an event's details. Bookings on every held resource move with
    /// the new span.
    pub fn update_event(
        &mut self,
        id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    ) -> Result<(), EngineError> {
        let held = {
            let event = self
                .events
                .get_mut(&id)
                .ok_or(EngineError::ReferentialError(id))?;
            event.title = title;
            event.description = description;
            if event.span == span {
                return Ok(());
            }
            event.span = span;
            event.allocations.clone()
        };
        for allocation_id in held {
            let Some(alloc) = self.allocations.get(&allocation_id) else {
                continue;
            };
            if let Some(rs) = self.resources.get_mut(&alloc.resource_id)
                && let Some(mut booking) = rs.remove_booking(allocation_id)
            {
                booking.span = span;
                rs.insert_booking(booking);
            }
        }
        Ok(())
    }

    /// Remove an event together with all of its allocations.
    pub fn remove_event(&mut self, id: Ulid) -> Result<(Event, Vec<Allocation>), EngineError> {
        if !self.events.contains_key(&id) {
            return Err(EngineError::ReferentialError(id));
        }
        let removed = self.remove_allocations_for_event(id);
        let event = self
            .events
            .remove(&id)
            .ok_or(EngineError::ReferentialError(id))?;
        Ok((event, removed))
    }

    // ── Allocations ──────────────────────────────────────────

    pub fn allocation(&self, id: &Ulid) -> Option<&Allocation> {
        self.allocations.get(id)
    }

    pub fn has_allocation(&self, event_id: Ulid, resource_id: Ulid) -> bool {
        self.events.get(&event_id).is_some_and(|e| {
            e.allocations
                .iter()
                .filter_map(|aid| self.allocations.get(aid))
                .any(|a| a.resource_id == resource_id)
        })
    }

    pub fn insert_allocation(&mut self, alloc: Allocation) -> Result<(), EngineError> {
        if self.allocations.contains_key(&alloc.id) {
            return Err(EngineError::AlreadyExists(alloc.id));
        }
        let span = self
            .events
            .get(&alloc.event_id)
            .map(|e| e.span)
            .ok_or(EngineError::ReferentialError(alloc.event_id))?;
        if !self.resources.contains_key(&alloc.resource_id) {
            return Err(EngineError::ReferentialError(alloc.resource_id));
        }
        if self.has_allocation(alloc.event_id, alloc.resource_id) {
            return Err(EngineError::DuplicateAllocation {
                event_id: alloc.event_id,
                resource_id: alloc.resource_id,
            });
        }

        if let Some(rs) = self.resources.get_mut(&alloc.resource_id) {
            rs.insert_booking(Booking {
                allocation_id: alloc.id,
                event_id: alloc.event_id,
                span,
            });
        }
        if let Some(event) = self.events.get_mut(&alloc.event_id) {
            event.allocations.push(alloc.id);
        }
        self.allocations.insert(alloc.id, alloc);
        Ok(())
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        let alloc = self.allocations.remove(&id)?;
        if let Some(rs) = self.resources.get_mut(&alloc.resource_id) {
            rs.remove_booking(id);
        }
        if let Some(event) = self.events.get_mut(&alloc.event_id) {
            event.allocations.retain(|aid| *aid != id);
        }
        Some(alloc)
    }

    pub fn remove_allocations_for_event(&mut self, event_id: Ulid) -> Vec<Allocation> {
        let held = self
            .events
            .get(&event_id)
            .map(|e| e.allocations.clone())
            .unwrap_or_default();
        held.into_iter()
            .filter_map(|aid| self.remove_allocation(aid))
            .collect()
    }

    /// Join an allocation with its event's title and interval.
    pub fn allocation_info(&self, alloc: &Allocation) -> Option<AllocationInfo> {
        let event = self.events.get(&alloc.event_id)?;
        Some(AllocationInfo {
            id: alloc.id,
            event_id: alloc.event_id,
            resource_id: alloc.resource_id,
            event_title: event.title.clone(),
            start: event.span.start,
            end: event.span.end,
        })
    }

    /// Allocations on a resource, ascending by start.
    pub fn allocations_for_resource(&self, resource_id: &Ulid) -> Vec<AllocationInfo> {
        let Some(rs) = self.resources.get(resource_id) else {
            return Vec::new();
        };
        rs.bookings
            .iter()
            .filter_map(|b| self.allocations.get(&b.allocation_id))
            .filter_map(|a| self.allocation_info(a))
            .collect()
    }

    /// Allocations held by an event, in allocation order.
    pub fn allocations_for_event(&self, event_id: &Ulid) -> Vec<AllocationInfo> {
        let Some(event) = self.events.get(event_id) else {
            return Vec::new();
        };
        event
            .allocations
            .iter()
            .filter_map(|aid| self.allocations.get(aid))
            .filter_map(|a| self.allocation_info(a))
            .collect()
    }

    pub fn all_allocations(&self) -> Vec<AllocationInfo> {
        self.allocations
            .values()
            .filter_map(|a| self.allocation_info(a))
            .collect()
    }

    // ── Change application ───────────────────────────────────

    /// The single entry point through which committed changes (live or
    /// replayed) mutate the ledger.
    pub fn apply(&mut self, change: &Change) -> Result<(), EngineError> {
        match change {
            Change::UserRegistered { id, username } => self.insert_user(*id, username.clone()),
            Change::ProfileUpdated {
                id,
                username,
                mobile,
                address,
            } => self.update_profile(*id, username.clone(), mobile.clone(), address.clone()),
            Change::ResourceCreated { id, name, kind } => {
                self.insert_resource(*id, name.clone(), kind.clone())
            }
            Change::ResourceUpdated { id, name, kind } => {
                self.update_resource(*id, name.clone(), kind.clone())
            }
            Change::EventCreated {
                id,
                owner_id,
                title,
                span,
                description,
            } => self.insert_event(*id, *owner_id, title.clone(), *span, description.clone()),
            Change::EventUpdated {
                id,
                title,
                span,
                description,
            } => self.update_event(*id, title.clone(), *span, description.clone()),
            Change::EventDeleted { id } => self.remove_event(*id).map(|_| ()),
            Change::ResourceAllocated {
                id,
                event_id,
                resource_id,
            } => self.insert_allocation(Allocation {
                id: *id,
                event_id: *event_id,
                resource_id: *resource_id,
            }),
            Change::ResourceDeallocated { id } => self
                .remove_allocation(*id)
                .map(|_| ())
                .ok_or(EngineError::ReferentialError(*id)),
        }
    }

    /// The minimal change sequence that rebuilds this ledger from empty.
    pub fn snapshot(&self) -> Vec<Change> {
        let mut changes = Vec::new();
        for user in self.users.values() {
            changes.push(Change::UserRegistered {
                id: user.id,
                username: user.username.clone(),
            });
            if user.mobile.is_some() || user.address.is_some() {
                changes.push(Change::ProfileUpdated {
                    id: user.id,
                    username: user.username.clone(),
                    mobile: user.mobile.clone(),
                    address: user.address.clone(),
                });
            }
        }
        for rs in self.resources.values() {
            changes.push(Change::ResourceCreated {
                id: rs.id,
                name: rs.name.clone(),
                kind: rs.kind.clone(),
            });
        }
        for event in self.events.values() {
            changes.push(Change::EventCreated {
                id: event.id,
                owner_id: event.owner_id,
                title: event.title.clone(),
                span: event.span,
                description: event.description.clone(),
            });
        }
        // Per event, so each event's allocation order survives a rebuild.
        for event in self.events.values() {
            for alloc in event.allocations.iter().filter_map(|aid| self.allocations.get(aid)) {
                changes.push(Change::ResourceAllocated {
                    id: alloc.id,
                    event_id: alloc.event_id,
                    resource_id: alloc.resource_id,
                });
            }
        }
        changes
    }

    /// Pairs of allocations on one resource whose intervals overlap. Empty in
    /// any ledger built through the engine.
    #[cfg(test)]
    pub(crate) fn overlapping_pairs(&self) -> Vec<(Ulid, Ulid)> {
        let mut pairs = Vec::new();
        for rs in self.resources.values() {
            for (i, a) in rs.bookings.iter().enumerate() {
                for b in &rs.bookings[i + 1..] {
                    if a.span.overlaps(&b.span) {
                        pairs.push((a.allocation_id, b.allocation_id));
                    }
                }
            }
        }
        pairs
    }
}
