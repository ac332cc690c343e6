//! Pure transforms applied to fetched events: filter out what was already delivered, then order.

use std::collections::HashSet;

use crate::event::Event;

/// Drop every event whose uuid is in `seen`, plus repeats of a uuid within `events` itself (the
/// first occurrence wins).
///
/// Upstream timestamps can be coarser than the event rate, so re-querying "since" an instant
/// returns events that were already delivered at that instant. Identity is the only thing that
/// tells them apart.
pub fn dedupe(events: Vec<Event>, seen: &HashSet<String>) -> Vec<Event> {
    let mut kept = HashSet::new();
    events
        .into_iter()
        .filter(|event| !seen.contains(event.uuid()) && kept.insert(event.uuid().to_owned()))
        .collect()
}

/// Stable sort by publication instant. Ties keep fetch order.
pub fn order(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by_key(Event::published_at);
    events
}
