use crate::memory::node::InternedStatement;
use crate::memory::store::{BulkInserted, MemoryStore};
use quadmem_common::error::StorageError;
use quadmem_common::StatementHandler;
use quadmem_model::{Quad, QuadRef};
use std::sync::MutexGuard;
use tracing::debug;

/// Populates a store outside of a transaction, e.g. at startup from a parsed
/// file or a binary snapshot.
///
/// A load is still atomic: the loaded statements become visible with a
/// single version publication when the session finishes, and a session
/// dropped before finishing undoes its insertions.
#[derive(Debug)]
pub struct MemoryStoreBulkLoader {
    store: MemoryStore,
}

impl MemoryStoreBulkLoader {
    pub(crate) fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    /// Opens a load session. Fails with [`StorageError::TransactionActive`]
    /// if a write transaction is open.
    pub fn session(&self) -> Result<BulkLoadSession<'_>, StorageError> {
        let guard = self.store.content().try_write_lock()?;
        let version = self.store.content().head_version() + 1;
        Ok(BulkLoadSession {
            store: &self.store,
            _guard: guard,
            version,
            undo: Vec::new(),
            namespaces: Vec::new(),
            loaded: 0,
            changed: false,
            finished: false,
        })
    }

    /// Loads a batch of explicit statements in one session.
    pub fn load_quads(
        &self,
        quads: impl IntoIterator<Item = Quad>,
    ) -> Result<usize, StorageError> {
        let mut session = self.session()?;
        for quad in quads {
            session.insert(quad.as_ref(), true);
        }
        Ok(session.finish())
    }
}

/// An open bulk load. Holds the store's transaction lock for its whole
/// lifetime.
pub struct BulkLoadSession<'a> {
    store: &'a MemoryStore,
    _guard: MutexGuard<'a, ()>,
    version: u64,
    undo: Vec<BulkInserted>,
    namespaces: Vec<(String, String)>,
    loaded: usize,
    changed: bool,
    finished: bool,
}

impl BulkLoadSession<'_> {
    /// Inserts one statement at the load version.
    pub fn insert(&mut self, quad: QuadRef<'_>, explicit: bool) {
        let content = self.store.content();
        let statement = InternedStatement {
            subject: content.registry.intern_subject(quad.subject),
            predicate: content.registry.intern_predicate(quad.predicate),
            object: content.registry.intern(quad.object),
            context: content.registry.intern_context(quad.graph_name),
        };
        let outcome = content.bulk_insert(statement, explicit, self.version);
        if !matches!(outcome, BulkInserted::Unchanged) {
            self.changed = true;
            self.undo.push(outcome);
        }
        self.loaded += 1;
    }

    /// Records a namespace declaration. Like statements, namespaces only
    /// become visible when the session finishes.
    pub fn set_namespace(&mut self, prefix: &str, iri: &str) {
        self.namespaces.push((prefix.to_owned(), iri.to_owned()));
    }

    /// Publishes the loaded statements and returns how many were handled.
    pub fn finish(mut self) -> usize {
        self.complete();
        self.loaded
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.undo.clear();
        for (prefix, iri) in self.namespaces.drain(..) {
            self.store.namespaces().set(&prefix, &iri);
        }
        if self.changed {
            self.store.content().publish(self.version);
            debug!(
                statements = self.loaded,
                version = self.version,
                "bulk load published"
            );
        }
    }

    fn abort(&mut self) {
        self.finished = true;
        self.namespaces.clear();
        let content = self.store.content();
        let undone = self.undo.len();
        for inserted in self.undo.drain(..) {
            content.undo_bulk_insert(inserted, self.version);
        }
        if undone > 0 {
            debug!(statements = undone, "bulk load aborted");
        }
    }
}

impl Drop for BulkLoadSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}

impl StatementHandler for BulkLoadSession<'_> {
    fn handle_statement(&mut self, statement: QuadRef<'_>) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::NoActiveTransaction);
        }
        self.insert(statement, true);
        Ok(())
    }

    fn handle_namespace(&mut self, prefix: &str, iri: &str) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::NoActiveTransaction);
        }
        self.set_namespace(prefix, iri);
        Ok(())
    }

    fn end(&mut self) -> Result<(), StorageError> {
        self.complete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadmem_model::{GraphName, NamedNode};

    fn quad(s: &str, o: &str) -> Quad {
        Quad::new(
            NamedNode::new_unchecked(format!("http://example.com/{s}")),
            NamedNode::new_unchecked("http://example.com/p"),
            NamedNode::new_unchecked(format!("http://example.com/{o}")),
            GraphName::DefaultGraph,
        )
    }

    #[test]
    fn test_load_is_atomic() {
        let store = MemoryStore::new();
        let loader = store.bulk_loader();
        let mut session = loader.session().unwrap();
        session.insert(quad("s1", "o1").as_ref(), true);
        session.insert(quad("s2", "o2").as_ref(), false);
        assert_eq!(store.len(), 0);
        assert_eq!(session.finish(), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(
            store
                .snapshot()
                .statements(None, None, None, None, true)
                .count(),
            1
        );
    }

    #[test]
    fn test_dropped_session_undoes_its_insertions() {
        let store = MemoryStore::new();
        store
            .transaction(|txn| {
                txn.add_statement(quad("s0", "o0").as_ref(), true);
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let loader = store.bulk_loader();
        {
            let mut session = loader.session().unwrap();
            session.insert(quad("s1", "o1").as_ref(), true);
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.raw_reader().len(), 1);

        // The same version number is reusable afterwards.
        assert_eq!(loader.load_quads(vec![quad("s1", "o1")]).unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_dropped_session_applies_no_namespaces() {
        let store = MemoryStore::new();
        let loader = store.bulk_loader();
        {
            let mut session = loader.session().unwrap();
            session.set_namespace("ex", "http://example.com/");
            session.insert(quad("s1", "o1").as_ref(), true);
        }
        assert!(store.namespaces().get("ex").is_none());

        let mut session = loader.session().unwrap();
        session.set_namespace("ex", "http://example.com/");
        session.finish();
        assert_eq!(
            store.namespaces().get("ex").as_deref(),
            Some("http://example.com/")
        );
    }

    #[test]
    fn test_session_excludes_transactions() {
        let store = MemoryStore::new();
        let loader = store.bulk_loader();
        let session = loader.session().unwrap();
        assert!(matches!(
            store.begin(),
            Err(StorageError::TransactionActive)
        ));
        drop(session);
        assert!(store.begin().is_ok());
    }
}
