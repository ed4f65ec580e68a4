use crate::model::*;

use super::store::Ledger;

fn round_hours(ms: Ms) -> f64 {
    let hours = ms as f64 / HOUR_MS as f64;
    (hours * 100.0).round() / 100.0
}

/// Per-resource utilized hours and upcoming bookings over an optional window.
///
/// An allocation counts when its event is not entirely outside the window
/// (`end < window_start` or `start > window_end` excludes it). Only the part
/// of the event inside the window adds to the total. Included events that end
/// after `now` are listed as upcoming, ascending by start.
///
/// Callers validate the window; an inverted one simply matches nothing.
pub fn build_report(
    ledger: &Ledger,
    window_start: Option<Ms>,
    window_end: Option<Ms>,
    now: Ms,
) -> Vec<ResourceUtilization> {
    ledger
        .resources()
        .map(|rs| {
            let mut utilized_ms: Ms = 0;
            let mut upcoming = Vec::new();

            for booking in &rs.bookings {
                let span = booking.span;
                if window_start.is_some_and(|ws| span.end < ws)
                    || window_end.is_some_and(|we| span.start > we)
                {
                    continue;
                }
                let overlap_start = window_start.map_or(span.start, |ws| span.start.max(ws));
                let overlap_end = window_end.map_or(span.end, |we| span.end.min(we));
                if overlap_end > overlap_start {
                    utilized_ms += overlap_end - overlap_start;
                }
                if span.end > now
                    && let Some(event) = ledger.event(&booking.event_id)
                {
                    upcoming.push(EventInfo::from(event));
                }
            }

            ResourceUtilization {
                resource_id: rs.id,
                name: rs.name.clone(),
                kind: rs.kind.clone(),
                total_hours_utilized: round_hours(utilized_ms),
                upcoming,
            }
        })
        .collect()
}
