//! Field-level merge of server state with unresolved local intents.

use crate::mutation::Operation;
use crate::types::Fields;

/// Merge a server snapshot into the local view of an entity.
///
/// Fields targeted by a pending operation keep their local value (or stay
/// absent if the local view lacks them). Every other field takes the
/// server value.
#[must_use]
pub fn merge_fields(local: &Fields, server: &Fields, pending: &[Operation]) -> Fields {
    let targets: Vec<_> = pending.iter().map(Operation::target).collect();
    let covered = |name: &str| targets.iter().any(|target| target.covers(name));

    let mut merged: Fields = server
        .iter()
        .filter(|(name, _)| !covered(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    for (name, value) in local {
        if covered(name) {
            merged.insert(name.clone(), value.clone());
        }
    }

    merged
}
