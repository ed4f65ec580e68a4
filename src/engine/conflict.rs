use ulid::Ulid;

use crate::model::*;

use super::store::Ledger;
use super::EngineError;

/// Build a span from raw bounds, rejecting empty/inverted and out-of-range
/// intervals.
pub(crate) fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// Every allocation on `resource_id` whose event interval overlaps
/// `candidate`, skipping allocations held by `exclude_event`.
///
/// Pure: reads the ledger, never errors. An unknown resource has no
/// conflicts. Results come in ledger order (ascending start).
pub(crate) fn find_conflicts(
    ledger: &Ledger,
    resource_id: &Ulid,
    candidate: &Span,
    exclude_event: Option<Ulid>,
) -> Vec<AllocationInfo> {
    let Some(rs) = ledger.resource(resource_id) else {
        return Vec::new();
    };
    rs.overlapping(candidate)
        .filter(|b| Some(b.event_id) != exclude_event)
        .filter_map(|b| ledger.allocation(&b.allocation_id))
        .filter_map(|a| ledger.allocation_info(a))
        .collect()
}

/// Oracle check over every resource an event holds. The first resource with
/// a conflict (in the event's allocation order) rejects the whole candidate.
pub(crate) fn check_event_resources(
    ledger: &Ledger,
    event: &Event,
    candidate: &Span,
) -> Result<(), EngineError> {
    for allocation_id in &event.allocations {
        let Some(alloc) = ledger.allocation(allocation_id) else {
            continue;
        };
        let conflicts = find_conflicts(ledger, &alloc.resource_id, candidate, Some(event.id));
        if !conflicts.is_empty() {
            return Err(EngineError::ResourceConflict {
                resource_id: alloc.resource_id,
                conflicts,
            });
        }
    }
    Ok(())
}
