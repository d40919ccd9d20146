use std::{collections::HashMap, time::Duration};

use crate::{ids::RecordId, record::Message};

/// Merge two copies of one ordered message collection.
///
/// Identity wins: every record lands in an id-keyed map, `current` first and
/// `incoming` second, so the incoming copy of a record supersedes the stored
/// one. The result is sorted ascending by `created_at` (ties broken by id so
/// the output is deterministic). Records present in either input survive
/// unless superseded by id; merging the same `incoming` again is a no-op.
pub fn merge_records(current: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut by_id: HashMap<RecordId, Message> =
        HashMap::with_capacity(current.len() + incoming.len());
    for record in current.iter().chain(incoming) {
        by_id.insert(record.id.clone(), record.clone());
    }

    let mut merged: Vec<Message> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

/// Collision heuristic for records that are the same human message under two
/// identities (client-temporary id vs. server id): same sender, same content,
/// timestamps closer than `window`.
pub fn is_likely_duplicate(a: &Message, b: &Message, window: Duration) -> bool {
    a.sender_kind == b.sender_kind
        && a.content == b.content
        && (a.created_at - b.created_at).num_milliseconds().unsigned_abs()
            < window.as_millis() as u64
}
