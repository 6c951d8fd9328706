//! API to access an in-memory [RDF dataset](https://www.w3.org/TR/rdf11-concepts/#dfn-rdf-dataset).
//!
//! The entry point of the module is the [`Store`] struct.

use crate::query::{BindingIter, BindingSet, EvaluationStrategy, TupleExpr};
use quadmem_model::{GraphNameRef, Namespace, NamedNodeRef, QuadRef, SubjectRef, TermRef};
use quadmem_storage::{
    read_snapshot, write_snapshot, MemStatementIter, MemStoreReader, MemTransaction, MemoryStore,
    MemoryStoreBulkLoader,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

pub use quadmem_common::error::{CorruptionError, StorageError};
pub use quadmem_common::{QuadPatternSource, StatementHandler};
pub use quadmem_storage::{FormatError, Statement};

/// An in-memory RDF dataset with snapshot isolation.
///
/// Readers observe the committed state as of the moment they were created
/// and are never affected by concurrent writes; writers are serialized, one
/// transaction at a time. Cloning the store is cheap and clones share the
/// same dataset.
///
/// Usage example:
/// ```
/// use quadmem::model::*;
/// use quadmem::store::Store;
///
/// let store = Store::new();
///
/// let ex = NamedNode::new("http://example.com")?;
/// let quad = Quad::new(ex.clone(), ex.clone(), ex.clone(), GraphName::DefaultGraph);
/// store.insert(quad.as_ref())?;
/// assert!(store.contains(quad.as_ref()));
/// assert_eq!(store.len(), 1);
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone, Default)]
pub struct Store {
    inner: MemoryStore,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
        }
    }

    /// Number of statements in the committed state.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, quad: QuadRef<'_>) -> bool {
        self.inner.contains(quad)
    }

    /// Inserts `quad` in its own transaction. Returns whether the statement
    /// was not already present.
    pub fn insert(&self, quad: QuadRef<'_>) -> Result<bool, StorageError> {
        self.inner
            .transaction(|txn| Ok::<_, StorageError>(txn.add_statement(quad, true)))
    }

    /// Removes `quad` in its own transaction. Returns whether the statement
    /// was present.
    pub fn remove(&self, quad: QuadRef<'_>) -> Result<bool, StorageError> {
        self.inner
            .transaction(|txn| Ok::<_, StorageError>(txn.remove(quad)))
    }

    /// Removes every statement in the given contexts, or everything with
    /// `None`. Returns the number of removed statements.
    pub fn clear(&self, contexts: Option<&[GraphNameRef<'_>]>) -> Result<usize, StorageError> {
        self.inner
            .transaction(|txn| Ok::<_, StorageError>(txn.clear(contexts)))
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    ///
    /// ```
    /// use quadmem::model::*;
    /// use quadmem::store::{Store, StorageError};
    ///
    /// let store = Store::new();
    /// let ex = NamedNode::new("http://example.com")?;
    /// store.transaction(|txn| {
    ///     txn.add_statement(QuadRef::new(&ex, &ex, &ex, GraphNameRef::DefaultGraph), true);
    ///     Ok::<_, StorageError>(())
    /// })?;
    /// assert_eq!(store.len(), 1);
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// ```
    pub fn transaction<'a, 'b: 'a, T, E: From<StorageError>>(
        &'b self,
        f: impl FnOnce(&mut MemTransaction<'a>) -> Result<T, E>,
    ) -> Result<T, E> {
        self.inner.transaction(f)
    }

    /// Starts an explicit transaction. Fails with
    /// [`StorageError::TransactionActive`] instead of blocking when another
    /// transaction is running. Dropping the transaction rolls it back.
    pub fn begin(&self) -> Result<MemTransaction<'_>, StorageError> {
        self.inner.begin()
    }

    /// A reader pinned to the current committed state.
    pub fn snapshot(&self) -> MemStoreReader {
        self.inner.snapshot()
    }

    /// Scans the committed statements matching the given pattern. `None`
    /// components are wildcards; a `contexts` list restricts matches to the
    /// listed contexts, with [`GraphNameRef::DefaultGraph`] standing for "no
    /// context". The iterator keeps observing the snapshot it was created
    /// from, whatever is committed while it is consumed.
    pub fn statements_for_pattern(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        contexts: Option<&[GraphNameRef<'_>]>,
    ) -> MemStatementIter {
        self.snapshot()
            .statements(subject, predicate, object, contexts, false)
    }

    /// An evaluation strategy over the current committed state, for callers
    /// that want to configure functions or budgets themselves.
    pub fn evaluation_strategy(&self) -> EvaluationStrategy {
        EvaluationStrategy::new(Arc::new(self.snapshot()))
    }

    /// Evaluates a query plan against the current committed state.
    ///
    /// ```
    /// use quadmem::model::*;
    /// use quadmem::query::{StatementPattern, TupleExpr};
    /// use quadmem::store::Store;
    ///
    /// let store = Store::new();
    /// let ex = NamedNode::new("http://example.com")?;
    /// store.insert(QuadRef::new(&ex, &ex, &ex, GraphNameRef::DefaultGraph))?;
    ///
    /// let s = Variable::new("s")?;
    /// let expr = TupleExpr::Pattern(StatementPattern::new(s.clone(), ex.clone(), ex.clone()));
    /// let mut solutions = store.evaluate(&expr);
    /// assert_eq!(
    ///     solutions.next().unwrap()?.get(&s),
    ///     Some(&ex.into())
    /// );
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// ```
    pub fn evaluate(&self, expr: &TupleExpr) -> BindingIter {
        self.evaluation_strategy().evaluate(expr, BindingSet::new())
    }

    /// Like [`evaluate`](Self::evaluate), but fails the query with
    /// [`QueryEvaluationError::SizeLimitExceeded`] once its materializing
    /// operators have buffered more than `max_size` solutions in total.
    ///
    /// [`QueryEvaluationError::SizeLimitExceeded`]: crate::query::QueryEvaluationError::SizeLimitExceeded
    pub fn evaluate_bounded(&self, expr: &TupleExpr, max_size: usize) -> BindingIter {
        self.evaluation_strategy()
            .with_size_limit(max_size)
            .evaluate(expr, BindingSet::new())
    }

    /// Declares a namespace prefix, replacing any previous declaration.
    pub fn set_namespace(&self, prefix: impl Into<String>, iri: impl Into<String>) {
        self.inner.namespaces().set(prefix, iri);
    }

    pub fn namespace(&self, prefix: &str) -> Option<String> {
        self.inner.namespaces().get(prefix)
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.inner.namespaces().iter()
    }

    pub fn remove_namespace(&self, prefix: &str) -> bool {
        self.inner.namespaces().remove(prefix)
    }

    /// Writes the committed statements and namespace declarations in the
    /// binary statement format.
    pub fn save_to(&self, write: impl Write) -> Result<(), StorageError> {
        write_snapshot(&self.snapshot(), self.inner.namespaces(), write)?;
        Ok(())
    }

    /// Loads a binary statement file on top of the current contents in one
    /// atomic bulk load: on any decoding error nothing is applied.
    pub fn load_from(&self, read: impl Read) -> Result<(), StorageError> {
        read_snapshot(read, &self.inner)?;
        Ok(())
    }

    /// Saves to `path` through a temporary sibling file and an atomic
    /// rename, so a crash mid-write never leaves a truncated file behind.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        self.save_to(&mut writer)?;
        let file = writer
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        self.load_from(BufReader::new(File::open(path)?))
    }

    /// Pushes every committed statement and namespace declaration into
    /// `handler`, bracketed by `start`/`end`.
    pub fn export(&self, handler: &mut dyn StatementHandler) -> Result<(), StorageError> {
        self.snapshot().export(handler, false)
    }

    /// A bulk loader writing directly into the store, bypassing the
    /// per-transaction bookkeeping. Intended for initial loads.
    pub fn bulk_loader(&self) -> MemoryStoreBulkLoader {
        self.inner.bulk_loader()
    }

    /// Drops statement history no live snapshot can observe. Runs inline on
    /// the calling thread and briefly takes the writer lock.
    pub fn compact(&self) {
        self.inner.compact();
    }
}
