use crate::memory::node::{StatementLifecycle, StatementNode, TxnStatus};
use crate::memory::store::MemStoreReader;
use crate::memory::value_registry::ValueId;
use quadmem_model::{GraphName, NamedNode, Quad, Subject, Term};
use std::sync::Arc;
use tracing::error;

/// How a scan treats the store's transaction and version state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Only statements committed at or before the scan's snapshot and not
    /// removed at or before it.
    Committed,
    /// Preview of the open transaction as if it had committed: uncommitted
    /// additions are included, statements marked for removal are excluded.
    Transaction,
    /// Every statement physically present, regardless of version and
    /// transaction state.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainKind {
    All,
    Subject,
    Predicate,
    Object,
    Context,
}

/// Walks one scan chain backwards and filters by pattern and visibility.
/// Single pass, read-only; holds its chain alive through strong links.
pub(crate) struct NodeScan {
    pub current: Option<Arc<StatementNode>>,
    pub kind: ChainKind,
    pub expect_subject: Option<ValueId>,
    pub expect_predicate: Option<ValueId>,
    pub expect_object: Option<ValueId>,
    /// `None` = any context; entries of `None` match the no-context slot.
    pub expect_contexts: Option<Vec<Option<ValueId>>>,
    pub snapshot: u64,
    pub mode: ReadMode,
    pub explicit_only: bool,
}

impl NodeScan {
    pub fn empty() -> Self {
        Self {
            current: None,
            kind: ChainKind::All,
            expect_subject: None,
            expect_predicate: None,
            expect_object: None,
            expect_contexts: None,
            snapshot: 0,
            mode: ReadMode::Committed,
            explicit_only: false,
        }
    }

    fn is_visible(&self, lifecycle: &StatementLifecycle) -> bool {
        match self.mode {
            ReadMode::Committed => {
                lifecycle.versions.contains(self.snapshot)
                    && (!self.explicit_only || lifecycle.explicit)
            }
            ReadMode::Transaction => {
                if matches!(lifecycle.status, TxnStatus::Deprecated | TxnStatus::Zombie) {
                    return false;
                }
                if !lifecycle.versions.contains(self.snapshot)
                    && lifecycle.status != TxnStatus::New
                {
                    return false;
                }
                if self.explicit_only {
                    // Pending explicit/inferred flips count as if committed.
                    if lifecycle.status == TxnStatus::Inferred {
                        return false;
                    }
                    if !lifecycle.explicit && lifecycle.status != TxnStatus::Explicit {
                        return false;
                    }
                }
                true
            }
            ReadMode::Raw => !self.explicit_only || lifecycle.explicit,
        }
    }
}

impl Iterator for NodeScan {
    type Item = Arc<StatementNode>;

    fn next(&mut self) -> Option<Arc<StatementNode>> {
        loop {
            let current = self.current.take()?;
            self.current = match self.kind {
                ChainKind::All => current.previous.lock().unwrap().clone(),
                ChainKind::Subject => current.previous_subject.lock().unwrap().clone(),
                ChainKind::Predicate => current.previous_predicate.lock().unwrap().clone(),
                ChainKind::Object => current.previous_object.lock().unwrap().clone(),
                ChainKind::Context => current.previous_context.lock().unwrap().clone(),
            };
            if let Some(expect_subject) = self.expect_subject {
                if current.statement.subject != expect_subject {
                    continue;
                }
            }
            if let Some(expect_predicate) = self.expect_predicate {
                if current.statement.predicate != expect_predicate {
                    continue;
                }
            }
            if let Some(expect_object) = self.expect_object {
                if current.statement.object != expect_object {
                    continue;
                }
            }
            if let Some(expect_contexts) = &self.expect_contexts {
                if !expect_contexts.contains(&current.statement.context) {
                    continue;
                }
            }
            if !self.is_visible(&current.lifecycle.lock().unwrap()) {
                continue;
            }
            return Some(current);
        }
    }
}

/// A decoded statement as yielded by pattern scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    quad: Quad,
    explicit: bool,
}

impl Statement {
    pub(crate) fn new(quad: Quad, explicit: bool) -> Self {
        Self { quad, explicit }
    }

    pub fn subject(&self) -> &Subject {
        &self.quad.subject
    }

    pub fn predicate(&self) -> &NamedNode {
        &self.quad.predicate
    }

    pub fn object(&self) -> &Term {
        &self.quad.object
    }

    pub fn context(&self) -> &GraphName {
        &self.quad.graph_name
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn quad(&self) -> &Quad {
        &self.quad
    }

    pub fn into_quad(self) -> Quad {
        self.quad
    }
}

/// Lazy, single-pass iterator over the statements matching a pattern.
///
/// Keeps its reader (and thus the reader's snapshot pin) alive until dropped,
/// so the store cannot reclaim versions the scan still needs.
pub struct MemStatementIter {
    pub(crate) scan: NodeScan,
    pub(crate) reader: MemStoreReader,
}

impl Iterator for MemStatementIter {
    type Item = Statement;

    fn next(&mut self) -> Option<Statement> {
        loop {
            let node = self.scan.next()?;
            match self.reader.decode_node(&node) {
                Ok(statement) => return Some(statement),
                Err(e) => {
                    // A dangling value id points at index corruption; skip the
                    // node rather than yielding garbage.
                    error!("skipping corrupt statement node: {e}");
                }
            }
        }
    }
}
