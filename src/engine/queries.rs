use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_interval;
use super::report::build_report;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_user(&self, id: &Ulid) -> Option<UserInfo> {
        self.ledger.read().await.user(id).map(UserInfo::from)
    }

    pub async fn list_users(&self) -> Vec<UserInfo> {
        self.ledger.read().await.users().map(UserInfo::from).collect()
    }

    pub async fn get_resource(&self, id: &Ulid) -> Option<ResourceInfo> {
        self.ledger.read().await.resource(id).map(ResourceInfo::from)
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        self.ledger
            .read()
            .await
            .resources()
            .map(ResourceInfo::from)
            .collect()
    }

    pub async fn get_event(&self, id: &Ulid) -> Option<EventInfo> {
        self.ledger.read().await.event(id).map(EventInfo::from)
    }

    /// All events, or only those owned by `owner`, ascending by start.
    pub async fn list_events(&self, owner: Option<Ulid>) -> Vec<EventInfo> {
        let ledger = self.ledger.read().await;
        let mut events: Vec<EventInfo> = ledger
            .events()
            .filter(|e| owner.is_none_or(|o| e.owner_id == o))
            .map(EventInfo::from)
            .collect();
        events.sort_by_key(|e| (e.start, e.id));
        events
    }

    pub async fn allocations_for_resource(&self, resource_id: &Ulid) -> Vec<AllocationInfo> {
        self.ledger.read().await.allocations_for_resource(resource_id)
    }

    pub async fn allocations_for_event(&self, event_id: &Ulid) -> Vec<AllocationInfo> {
        self.ledger.read().await.allocations_for_event(event_id)
    }

    pub async fn all_allocations(&self) -> Vec<AllocationInfo> {
        self.ledger.read().await.all_allocations()
    }

    /// Ask the oracle what a proposed interval would collide with on one
    /// resource, without changing anything.
    pub async fn find_conflicts(
        &self,
        resource_id: &Ulid,
        start: Ms,
        end: Ms,
        exclude_event: Option<Ulid>,
    ) -> Result<Vec<AllocationInfo>, EngineError> {
        let span = validate_interval(start, end)?;
        let ledger = self.ledger.read().await;
        if ledger.resource(resource_id).is_none() {
            return Err(EngineError::ReferentialError(*resource_id));
        }
        Ok(super::conflict::find_conflicts(
            &ledger,
            resource_id,
            &span,
            exclude_event,
        ))
    }

    /// Utilization of every resource over an optional window, computed from
    /// one consistent view of the ledger.
    pub async fn utilization_report(
        &self,
        window_start: Option<Ms>,
        window_end: Option<Ms>,
        now: Ms,
    ) -> Result<Vec<ResourceUtilization>, EngineError> {
        if let (Some(start), Some(end)) = (window_start, window_end)
            && start > end
        {
            return Err(EngineError::InvalidInterval { start, end });
        }
        let ledger = self.ledger.read().await;
        Ok(build_report(&ledger, window_start, window_end, now))
    }
}
