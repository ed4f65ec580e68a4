use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_event_resources, find_conflicts, validate_interval};
use super::store::Ledger;
use super::{Engine, EngineError, WalCommand};

fn required_text(
    value: &str,
    max_len: usize,
    empty: &'static str,
    too_long: &'static str,
) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::InvalidInput(empty));
    }
    if value.chars().count() > max_len {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(value.to_string())
}

/// Blank means absent.
fn optional_text(
    value: Option<String>,
    max_len: usize,
    too_long: &'static str,
) -> Result<Option<String>, EngineError> {
    match value {
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) if v.chars().count() > max_len => Err(EngineError::LimitExceeded(too_long)),
        other => Ok(other),
    }
}

fn note_rejection(e: &EngineError) {
    if let EngineError::ResourceConflict {
        resource_id,
        conflicts,
    } = e
    {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        debug!(
            "rejected: resource {resource_id} has {} conflicting allocation(s)",
            conflicts.len()
        );
    }
}

/// Look up an event and check that `requester` owns it.
fn owned_event(ledger: &Ledger, event_id: Ulid, requester: Ulid) -> Result<&Event, EngineError> {
    let event = ledger
        .event(&event_id)
        .ok_or(EngineError::ReferentialError(event_id))?;
    if event.owner_id != requester {
        return Err(EngineError::Unauthorized {
            event_id,
            user_id: requester,
        });
    }
    Ok(event)
}

fn event_info(ledger: &Ledger, id: Ulid) -> Result<EventInfo, EngineError> {
    ledger
        .event(&id)
        .map(EventInfo::from)
        .ok_or(EngineError::ReferentialError(id))
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(&self, id: Ulid, username: &str) -> Result<UserInfo, EngineError> {
        let username = required_text(
            username,
            MAX_USERNAME_LEN,
            "username must not be empty",
            "username too long",
        )?;
        let mut ledger = self.ledger.write().await;
        if ledger.user_count() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if ledger.user(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if ledger.username_owner(&username).is_some() {
            return Err(EngineError::NameTaken(username));
        }

        let change = Change::UserRegistered { id, username };
        self.persist_and_apply(&mut ledger, &change).await?;
        info!("registered user {id}");
        ledger
            .user(&id)
            .map(UserInfo::from)
            .ok_or(EngineError::ReferentialError(id))
    }

    /// Update a user's profile. `None` leaves a field as stored; for mobile
    /// and address, `Some(None)` clears it. The merge with the stored record
    /// happens under the write lock, so concurrent updates of different
    /// fields never undo each other.
    pub async fn update_profile(
        &self,
        id: Ulid,
        username: Option<&str>,
        mobile: Option<Option<String>>,
        address: Option<Option<String>>,
    ) -> Result<UserInfo, EngineError> {
        let mut ledger = self.ledger.write().await;
        let current = ledger.user(&id).ok_or(EngineError::ReferentialError(id))?;
        let username = required_text(
            username.unwrap_or(&current.username),
            MAX_USERNAME_LEN,
            "username must not be empty",
            "username too long",
        )?;
        let mobile = match mobile {
            Some(m) => optional_text(m.map(|m| m.trim().to_string()), MAX_PROFILE_FIELD_LEN, "mobile too long")?,
            None => current.mobile.clone(),
        };
        let address = match address {
            Some(a) => optional_text(a.map(|a| a.trim().to_string()), MAX_PROFILE_FIELD_LEN, "address too long")?,
            None => current.address.clone(),
        };
        if ledger.username_owner(&username).is_some_and(|owner| owner != id) {
            return Err(EngineError::NameTaken(username));
        }

        let change = Change::ProfileUpdated {
            id,
            username,
            mobile,
            address,
        };
        self.persist_and_apply(&mut ledger, &change).await?;
        ledger
            .user(&id)
            .map(UserInfo::from)
            .ok_or(EngineError::ReferentialError(id))
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, id: Ulid, name: &str, kind: &str) -> Result<ResourceInfo, EngineError> {
        let name = required_text(
            name,
            MAX_RESOURCE_NAME_LEN,
            "resource name must not be empty",
            "resource name too long",
        )?;
        let kind = required_text(
            kind,
            MAX_RESOURCE_TYPE_LEN,
            "resource type must not be empty",
            "resource type too long",
        )?;
        let mut ledger = self.ledger.write().await;
        if ledger.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if ledger.resource(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if ledger.resource_name_owner(&name).is_some() {
            return Err(EngineError::NameTaken(name));
        }

        let change = Change::ResourceCreated { id, name, kind };
        self.persist_and_apply(&mut ledger, &change).await?;
        info!("created resource {id}");
        ledger
            .resource(&id)
            .map(ResourceInfo::from)
            .ok_or(EngineError::ReferentialError(id))
    }

    /// Rename or retype a resource; `None` keeps the stored value.
    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<&str>,
        kind: Option<&str>,
    ) -> Result<ResourceInfo, EngineError> {
        let mut ledger = self.ledger.write().await;
        let current = ledger
            .resource(&id)
            .ok_or(EngineError::ReferentialError(id))?;
        let name = required_text(
            name.unwrap_or(&current.name),
            MAX_RESOURCE_NAME_LEN,
            "resource name must not be empty",
            "resource name too long",
        )?;
        let kind = required_text(
            kind.unwrap_or(&current.kind),
            MAX_RESOURCE_TYPE_LEN,
            "resource type must not be empty",
            "resource type too long",
        )?;
        if ledger.resource_name_owner(&name).is_some_and(|owner| owner != id) {
            return Err(EngineError::NameTaken(name));
        }

        let change = Change::ResourceUpdated { id, name, kind };
        self.persist_and_apply(&mut ledger, &change).await?;
        ledger
            .resource(&id)
            .map(ResourceInfo::from)
            .ok_or(EngineError::ReferentialError(id))
    }

    // ── Events ───────────────────────────────────────────────

    /// New events hold no resources, so there is nothing to conflict with.
    pub async fn create_event(
        &self,
        id: Ulid,
        owner_id: Ulid,
        title: &str,
        start: Ms,
        end: Ms,
        description: Option<String>,
    ) -> Result<EventInfo, EngineError> {
        let span = validate_interval(start, end)?;
        let title = required_text(title, MAX_TITLE_LEN, "title must not be empty", "title too long")?;
        let description = optional_text(description, MAX_DESCRIPTION_LEN, "description too long")?;

        let mut ledger = self.ledger.write().await;
        if ledger.event_count() >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        if ledger.event(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if ledger.user(&owner_id).is_none() {
            return Err(EngineError::ReferentialError(owner_id));
        }

        let change = Change::EventCreated {
            id,
            owner_id,
            title,
            span,
            description,
        };
        self.persist_and_apply(&mut ledger, &change).await?;
        info!("created event {id} for user {owner_id}");
        event_info(&ledger, id)
    }

    /// Move an event to a new interval. All-or-nothing across every resource
    /// the event holds; an unchanged interval is a no-op that skips the
    /// conflict check entirely.
    pub async fn reschedule_event(
        &self,
        event_id: Ulid,
        start: Ms,
        end: Ms,
        requester: Ulid,
    ) -> Result<EventInfo, EngineError> {
        let mut ledger = self.ledger.write().await;
        let event = owned_event(&ledger, event_id, requester)?;
        let span = validate_interval(start, end)?;
        let title = event.title.clone();
        let description = event.description.clone();
        self.commit_event_update(&mut ledger, event_id, title, span, description)
            .await
    }

    /// Change any of title, start, end and description in one change.
    /// Unset fields (`None`) keep their stored values, read under the same
    /// write lock as the commit; `Some(None)` clears the description.
    pub async fn edit_event(
        &self,
        event_id: Ulid,
        requester: Ulid,
        title: Option<&str>,
        start: Option<Ms>,
        end: Option<Ms>,
        description: Option<Option<String>>,
    ) -> Result<EventInfo, EngineError> {
        let mut ledger = self.ledger.write().await;
        let event = owned_event(&ledger, event_id, requester)?;
        let span = validate_interval(
            start.unwrap_or(event.span.start),
            end.unwrap_or(event.span.end),
        )?;
        let title = required_text(
            title.unwrap_or(&event.title),
            MAX_TITLE_LEN,
            "title must not be empty",
            "title too long",
        )?;
        let description = match description {
            Some(d) => optional_text(d, MAX_DESCRIPTION_LEN, "description too long")?,
            None => event.description.clone(),
        };
        self.commit_event_update(&mut ledger, event_id, title, span, description)
            .await
    }

    async fn commit_event_update(
        &self,
        ledger: &mut Ledger,
        event_id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    ) -> Result<EventInfo, EngineError> {
        let current = ledger
            .event(&event_id)
            .ok_or(EngineError::ReferentialError(event_id))?;
        let span_changed = current.span != span;
        if !span_changed && current.title == title && current.description == description {
            return Ok(EventInfo::from(current));
        }
        if span_changed {
            check_event_resources(ledger, current, &span).inspect_err(note_rejection)?;
        }

        let change = Change::EventUpdated {
            id: event_id,
            title,
            span,
            description,
        };
        self.persist_and_apply(ledger, &change).await?;
        if span_changed {
            info!("rescheduled event {event_id}");
        }
        event_info(ledger, event_id)
    }

    /// Delete an event and, in the same change, every allocation it holds.
    pub async fn delete_event(&self, event_id: Ulid, requester: Ulid) -> Result<EventInfo, EngineError> {
        let mut ledger = self.ledger.write().await;
        let info = EventInfo::from(owned_event(&ledger, event_id, requester)?);

        let change = Change::EventDeleted { id: event_id };
        self.persist_and_apply(&mut ledger, &change).await?;
        info!("deleted event {event_id}");
        Ok(info)
    }

    // ── Allocations ──────────────────────────────────────────

    /// Bind a resource to an event for the event's full interval.
    ///
    /// Conflicts are checked before duplicates, so a pair that already exists
    /// reports `AlreadyAllocated` only when the resource is otherwise free.
    pub async fn allocate_resource(
        &self,
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        requester: Option<Ulid>,
    ) -> Result<AllocationInfo, EngineError> {
        let mut ledger = self.ledger.write().await;
        let event = ledger
            .event(&event_id)
            .ok_or(EngineError::ReferentialError(event_id))?;
        if let Some(user_id) = requester
            && user_id != event.owner_id
        {
            return Err(EngineError::Unauthorized { event_id, user_id });
        }
        let rs = ledger
            .resource(&resource_id)
            .ok_or(EngineError::ReferentialError(resource_id))?;
        if rs.bookings.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }

        let conflicts = find_conflicts(&ledger, &resource_id, &event.span, Some(event_id));
        if !conflicts.is_empty() {
            let err = EngineError::ResourceConflict {
                resource_id,
                conflicts,
            };
            note_rejection(&err);
            return Err(err);
        }
        if ledger.has_allocation(event_id, resource_id) {
            return Err(EngineError::AlreadyAllocated {
                event_id,
                resource_id,
            });
        }
        if ledger.allocation(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let change = Change::ResourceAllocated {
            id,
            event_id,
            resource_id,
        };
        self.persist_and_apply(&mut ledger, &change).await?;
        info!("allocated resource {resource_id} to event {event_id}");
        ledger
            .allocation(&id)
            .and_then(|a| ledger.allocation_info(a))
            .ok_or(EngineError::ReferentialError(id))
    }

    pub async fn deallocate_resource(
        &self,
        id: Ulid,
        requester: Option<Ulid>,
    ) -> Result<AllocationInfo, EngineError> {
        let mut ledger = self.ledger.write().await;
        let info = ledger
            .allocation(&id)
            .and_then(|a| ledger.allocation_info(a))
            .ok_or(EngineError::ReferentialError(id))?;
        if let Some(user_id) = requester {
            owned_event(&ledger, info.event_id, user_id)?;
        }

        let change = Change::ResourceDeallocated { id };
        self.persist_and_apply(&mut ledger, &change).await?;
        info!(
            "released resource {} from event {}",
            info.resource_id, info.event_id
        );
        Ok(info)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal change set that recreates the ledger.
    ///
    /// The read lock is held until the swap completes: writers need the write
    /// lock to append, so no append can land in the file being replaced.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let ledger = self.ledger.read().await;
        let changes = ledger.snapshot();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { changes, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(ledger);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
