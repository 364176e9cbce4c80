//! Snapshot diffing shared by the gateway backend pools and the RPC connection pools.
use std::collections::HashSet;

use crate::ports::discovery::Instance;

/// Result of comparing the identities a pool currently holds with a discovery snapshot.
///
/// The three sets are disjoint by identity.
#[derive(Debug, Default, PartialEq)]
pub struct Reconciliation<'a> {
    /// Instances whose identity is already pooled; their bookkeeping is refreshed
    pub keep: Vec<&'a Instance>,
    /// Instances that need a new transport
    pub to_create: Vec<&'a Instance>,
    /// Pooled identities absent from the snapshot
    pub to_remove: Vec<String>,
}

impl Reconciliation<'_> {
    /// Nothing to build and nothing to close.
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_remove.is_empty()
    }
}

/// Diff `current` identities against a discovered snapshot.
///
/// Duplicate identities in the snapshot collapse to their first occurrence.
/// Output order follows the snapshot for `keep`/`to_create` and `current`
/// for `to_remove`.
pub fn reconcile<'a, I, S>(current: I, discovered: &'a [Instance]) -> Reconciliation<'a>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let current: Vec<S> = current.into_iter().collect();
    let held: HashSet<&str> = current.iter().map(AsRef::as_ref).collect();

    let mut seen = HashSet::with_capacity(discovered.len());
    let mut plan = Reconciliation::default();

    for instance in discovered {
        let identity = instance.identity();
        if held.contains(identity.as_str()) {
            if seen.insert(identity) {
                plan.keep.push(instance);
            }
        } else if seen.insert(identity) {
            plan.to_create.push(instance);
        }
    }

    plan.to_remove = current
        .iter()
        .map(AsRef::as_ref)
        .filter(|id| !seen.contains(*id))
        .map(str::to_owned)
        .collect();

    plan
}
