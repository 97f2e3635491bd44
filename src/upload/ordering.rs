//! Sibling ordering for to-many relationships
//!
//! Siblings with a supplied ordering value keep it. The rest are numbered
//! after the largest supplied value in input order. Equal values sort by
//! storage order.

use crate::store::StoredRecord;
use crate::value::{field_or_null, RecordId};

/// Position for each participating sibling, in input order
pub fn assign_positions(explicit: &[Option<i64>]) -> Vec<i64> {
    let base = explicit.iter().flatten().copied().max().unwrap_or(0);
    let mut next = base;
    explicit
        .iter()
        .map(|supplied| match supplied {
            Some(position) => *position,
            None => {
                next += 1;
                next
            }
        })
        .collect()
}

/// Sibling IDs in display order: by ordering value, then storage order.
/// Records without a value come last.
pub fn sibling_order(records: &[StoredRecord], ordering_field: &str) -> Vec<RecordId> {
    let mut keyed: Vec<(Option<i64>, usize, RecordId)> = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let position = field_or_null(&record.values, ordering_field).as_integer();
            (position, index, record.id)
        })
        .collect();
    keyed.sort_by_key(|(position, index, _)| (position.is_none(), *position, *index));
    keyed.into_iter().map(|(_, _, id)| id).collect()
}
