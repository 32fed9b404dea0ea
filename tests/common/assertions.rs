//! Custom test assertions for pipeline tests

use media_relay::{Event, Status, WorkItemId};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::broadcast;

/// Drain every event currently buffered in the receiver
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Assert every item's status changes chain from Pending and only move forward
pub fn assert_monotonic(events: &[Event]) {
    let mut current: HashMap<WorkItemId, Status> = HashMap::new();
    for event in events {
        if let Event::StatusChanged { id, from, to } = event {
            let previous = current.get(id).copied().unwrap_or(Status::Pending);
            assert_eq!(
                previous, *from,
                "item {id}: transition {from:?} -> {to:?} does not start from {previous:?}"
            );
            assert!(
                from.can_transition_to(*to),
                "item {id}: illegal transition {from:?} -> {to:?}"
            );
            current.insert(id.clone(), *to);
        }
    }
}

/// Statuses an item went through, starting with Pending
pub fn status_path(events: &[Event], item: &WorkItemId) -> Vec<Status> {
    let mut path = vec![Status::Pending];
    for event in events {
        if let Event::StatusChanged { id, to, .. } = event
            && id == item
        {
            path.push(*to);
        }
    }
    path
}

/// Assert the scratch directory holds no files
pub fn assert_scratch_empty(dir: &Path) {
    let leftovers: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(leftovers.is_empty(), "scratch not empty: {leftovers:?}");
}

/// Count events matching a predicate
pub fn count_events<F>(events: &[Event], predicate: F) -> usize
where
    F: Fn(&Event) -> bool,
{
    events.iter().filter(|e| predicate(e)).count()
}
