use crate::memory::value_registry::ValueId;
use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

/// A statement as stored in the index: four interned value handles.
/// `context: None` is the "no context" (default graph) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct InternedStatement {
    pub subject: ValueId,
    pub predicate: ValueId,
    pub object: ValueId,
    pub context: Option<ValueId>,
}

/// A statement's state relative to the currently open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// No pending change.
    Neutral,
    /// Added in the open transaction, not yet committed.
    New,
    /// Inferred statement that the open transaction asserts explicitly.
    Explicit,
    /// Explicit statement that the open transaction downgrades to inferred.
    Inferred,
    /// Committed statement marked for removal by the open transaction.
    Deprecated,
    /// Added and removed within the same open transaction; never visible.
    Zombie,
}

/// Committed visibility intervals of a statement.
///
/// A statement committed at version `s` and removed at version `e` is visible
/// to snapshots in `s..e`. Re-asserting a removed statement opens a further
/// interval, which keeps the earlier one readable for old snapshots.
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub(crate) enum VersionRange {
    #[default]
    Empty,
    Start(u64),
    StartEnd(u64, u64),
    Multi(Box<[u64]>),
}

impl VersionRange {
    pub fn contains(&self, version: u64) -> bool {
        match self {
            VersionRange::Empty => false,
            VersionRange::Start(start) => *start <= version,
            VersionRange::StartEnd(start, end) => *start <= version && version < *end,
            VersionRange::Multi(bounds) => {
                for interval in bounds.chunks(2) {
                    match interval {
                        [start, end] => {
                            if *start <= version && version < *end {
                                return true;
                            }
                        }
                        [start] => {
                            if *start <= version {
                                return true;
                            }
                        }
                        _ => (),
                    }
                }
                false
            }
        }
    }

    /// Opens a new interval starting at `version`. Returns `false` if the
    /// range is already open-ended.
    pub fn add(&mut self, version: u64) -> bool {
        match self {
            VersionRange::Empty => {
                *self = VersionRange::Start(version);
                true
            }
            VersionRange::Start(_) => false,
            VersionRange::StartEnd(start, end) => {
                *self = if version == *end {
                    VersionRange::Start(*start)
                } else {
                    VersionRange::Multi(Box::new([*start, *end, version]))
                };
                true
            }
            VersionRange::Multi(bounds) => {
                if bounds.len() % 2 == 0 {
                    *self = VersionRange::Multi(push_bound(bounds, version));
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Closes the open interval at `version`. Returns `false` if there is no
    /// open interval.
    pub fn remove(&mut self, version: u64) -> bool {
        match self {
            VersionRange::Empty | VersionRange::StartEnd(_, _) => false,
            VersionRange::Start(start) => {
                *self = if *start == version {
                    VersionRange::Empty
                } else {
                    VersionRange::StartEnd(*start, version)
                };
                true
            }
            VersionRange::Multi(bounds) => {
                if bounds.len() % 2 == 0 {
                    false
                } else {
                    *self = match bounds.as_ref() {
                        [start, end, last] if *last == version => {
                            VersionRange::StartEnd(*start, *end)
                        }
                        _ => VersionRange::Multi(push_bound(bounds, version)),
                    };
                    true
                }
            }
        }
    }

    /// Whether no snapshot at or after `oldest` can observe this statement.
    pub fn expired_before(&self, oldest: u64) -> bool {
        match self {
            VersionRange::Empty => true,
            VersionRange::Start(_) => false,
            VersionRange::StartEnd(_, end) => *end <= oldest,
            VersionRange::Multi(bounds) => {
                bounds.len() % 2 == 0 && bounds.last().is_some_and(|end| *end <= oldest)
            }
        }
    }
}

fn push_bound(bounds: &[u64], bound: u64) -> Box<[u64]> {
    let mut out = Vec::with_capacity(bounds.len() + 1);
    out.extend_from_slice(bounds);
    out.push(bound);
    out.into_boxed_slice()
}

#[derive(Debug)]
pub(crate) struct StatementLifecycle {
    pub versions: VersionRange,
    pub status: TxnStatus,
    pub explicit: bool,
}

/// One entry of the statement index.
///
/// Nodes are owned by the index's statement set and threaded into five
/// backward scan chains (all statements, per subject, per predicate, per
/// object, per context). Links are strong references so that a detached node
/// kept alive by a running iterator can still reach its predecessors; the
/// chains are acyclic (strictly backward in insertion order).
#[derive(Debug)]
pub(crate) struct StatementNode {
    pub statement: InternedStatement,
    pub lifecycle: Mutex<StatementLifecycle>,
    pub previous: Mutex<Option<Arc<StatementNode>>>,
    pub previous_subject: Mutex<Option<Arc<StatementNode>>>,
    pub previous_predicate: Mutex<Option<Arc<StatementNode>>>,
    pub previous_object: Mutex<Option<Arc<StatementNode>>>,
    pub previous_context: Mutex<Option<Arc<StatementNode>>>,
}

impl StatementNode {
    pub fn is_visible_at(&self, snapshot: u64) -> bool {
        self.lifecycle.lock().unwrap().versions.contains(snapshot)
    }
}

impl PartialEq for StatementNode {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.statement == other.statement
    }
}

impl Eq for StatementNode {}

impl Hash for StatementNode {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.statement.hash(state);
    }
}

impl Borrow<InternedStatement> for Arc<StatementNode> {
    fn borrow(&self) -> &InternedStatement {
        &self.statement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        let mut range = VersionRange::default();

        assert!(range.add(1));
        assert!(!range.add(1));
        assert!(range.contains(1));
        assert!(!range.contains(0));
        assert!(range.contains(2));

        assert!(range.remove(1));
        assert!(!range.remove(1));
        assert!(!range.contains(1));

        assert!(range.add(1));
        assert!(range.remove(2));
        assert!(!range.remove(2));
        assert!(range.contains(1));
        assert!(!range.contains(2));

        assert!(range.add(2));
        assert!(range.contains(3));

        assert!(range.remove(2));
        assert!(range.add(4));
        assert!(range.remove(6));
        assert!(!range.contains(3));
        assert!(range.contains(4));
        assert!(!range.contains(6));
    }

    #[test]
    fn test_expired_before() {
        let mut range = VersionRange::default();
        assert!(range.expired_before(0));

        assert!(range.add(1));
        assert!(!range.expired_before(100));

        assert!(range.remove(3));
        assert!(!range.expired_before(2));
        assert!(range.expired_before(3));

        assert!(range.add(5));
        assert!(range.remove(7));
        assert!(matches!(range, VersionRange::Multi(_)));
        assert!(!range.expired_before(6));
        assert!(range.expired_before(7));
    }
}
