use crate::memory::iter::{ChainKind, MemStatementIter, NodeScan, ReadMode, Statement};
use crate::memory::namespaces::NamespaceStore;
use crate::memory::node::{
    InternedStatement, StatementLifecycle, StatementNode, TxnStatus, VersionRange,
};
use crate::memory::value_registry::{MemValueRegistry, ValueId};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use quadmem_common::error::{CorruptionError, StorageError};
use quadmem_common::QuadPatternSource;
use quadmem_model::{GraphNameRef, NamedNodeRef, Quad, QuadRef, SubjectRef, TermRef};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::collections::BTreeMap;
use std::hash::BuildHasherDefault;
use std::mem::take;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type FxBuild = BuildHasherDefault<FxHasher>;

/// Head of one keyed scan chain with its element count. The count feeds
/// chain selection: a pattern scan walks the shortest applicable chain.
#[derive(Debug)]
struct ChainHead {
    node: Arc<StatementNode>,
    count: u64,
}

type LinkAccessor = fn(&StatementNode) -> &Mutex<Option<Arc<StatementNode>>>;

/// Outcome of one bulk-load insertion, kept by the load session so a failed
/// load can be undone before anything is published.
#[derive(Debug)]
pub(crate) enum BulkInserted {
    Created(Arc<StatementNode>),
    Reopened(Arc<StatementNode>),
    Unchanged,
}

/// In-memory MVCC statement store.
///
/// Statements are interned through a value registry and kept as nodes in a
/// set that doubles as the duplicate index; every node is threaded into five
/// backward scan chains. Reads are lock-free against the committed state:
/// a snapshot is identified by a version number published with a single
/// atomic store at commit, so readers either see all of a commit or none of
/// it. Writes are serialized through a single transaction lock.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    content: Arc<Content>,
}

#[derive(Debug)]
pub(crate) struct Content {
    pub(crate) registry: MemValueRegistry,
    statements: DashSet<Arc<StatementNode>, FxBuild>,
    all_head: Mutex<Option<Arc<StatementNode>>>,
    subject_heads: DashMap<ValueId, ChainHead, FxBuild>,
    predicate_heads: DashMap<ValueId, ChainHead, FxBuild>,
    object_heads: DashMap<ValueId, ChainHead, FxBuild>,
    context_heads: DashMap<Option<ValueId>, ChainHead, FxBuild>,
    /// Currently published snapshot version. Only ever written while the
    /// transaction lock is held; the Release store is the publication point.
    version: AtomicU64,
    writer: Mutex<()>,
    /// version → number of readers pinned to it.
    pins: Mutex<BTreeMap<u64, usize>>,
    namespaces: NamespaceStore,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            content: Arc::new(Content {
                registry: MemValueRegistry::new(),
                statements: DashSet::with_hasher(FxBuild::default()),
                all_head: Mutex::new(None),
                subject_heads: DashMap::with_hasher(FxBuild::default()),
                predicate_heads: DashMap::with_hasher(FxBuild::default()),
                object_heads: DashMap::with_hasher(FxBuild::default()),
                context_heads: DashMap::with_hasher(FxBuild::default()),
                version: AtomicU64::new(0),
                writer: Mutex::new(()),
                pins: Mutex::new(BTreeMap::new()),
                namespaces: NamespaceStore::new(),
            }),
        }
    }

    /// The currently published snapshot version.
    pub fn current_snapshot(&self) -> u64 {
        self.content.version.load(Ordering::Acquire)
    }

    /// Pins the current committed state and returns a reader for it. The
    /// reader keeps observing exactly this state for its whole lifetime,
    /// concurrent commits notwithstanding.
    pub fn snapshot(&self) -> MemStoreReader {
        MemStoreReader::pinned_at_head(Arc::clone(&self.content), ReadMode::Committed)
    }

    /// A reader over every physically present statement, pending and expired
    /// ones included. Mostly useful for diagnostics and tests.
    pub fn raw_reader(&self) -> MemStoreReader {
        MemStoreReader::pinned_at_head(Arc::clone(&self.content), ReadMode::Raw)
    }

    /// Starts a write transaction. Fails with
    /// [`StorageError::TransactionActive`] if another transaction is open;
    /// this never blocks.
    pub fn begin(&self) -> Result<MemTransaction<'_>, StorageError> {
        let guard = self
            .content
            .writer
            .try_lock()
            .map_err(|_| StorageError::TransactionActive)?;
        Ok(MemTransaction {
            store: self,
            _guard: guard,
            touched: Vec::new(),
            finished: false,
        })
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    pub fn transaction<'a, 'b: 'a, T, E: From<StorageError>>(
        &'b self,
        f: impl FnOnce(&mut MemTransaction<'a>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut transaction = self.begin().map_err(E::from)?;
        match f(&mut transaction) {
            Ok(result) => {
                transaction.commit();
                Ok(result)
            }
            Err(e) => {
                transaction.rollback();
                Err(e)
            }
        }
    }

    /// Number of statements visible in the current committed state.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `quad` is visible (explicit or inferred) in the current
    /// committed state.
    pub fn contains(&self, quad: QuadRef<'_>) -> bool {
        self.snapshot().contains(quad)
    }

    pub fn namespaces(&self) -> &NamespaceStore {
        &self.content.namespaces
    }

    /// Reclaims statement nodes that no pinned snapshot can observe anymore,
    /// then drops registry entries no surviving statement references.
    ///
    /// Takes the transaction lock, so it cannot run while a write
    /// transaction is open. Concurrent readers are unaffected: their chains
    /// stay reachable through the nodes they already hold.
    pub fn compact(&self) {
        let _guard = self.content.writer.lock().unwrap();
        self.content.compact();
    }

    /// Returns a loader for populating this store outside of a transaction,
    /// e.g. from a parsed file or a binary snapshot.
    pub fn bulk_loader(&self) -> crate::memory::loader::MemoryStoreBulkLoader {
        crate::memory::loader::MemoryStoreBulkLoader::new(self.clone())
    }

    pub(crate) fn content(&self) -> &Arc<Content> {
        &self.content
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Content {
    fn pin(&self, version: u64) {
        *self.pins.lock().unwrap().entry(version).or_insert(0) += 1;
    }

    /// Loads the published version and pins it under one pins-lock
    /// acquisition, so a commit plus compaction interleaved between the load
    /// and the pin cannot reclaim the interval the reader is about to use.
    fn pin_current(&self) -> u64 {
        let mut pins = self.pins.lock().unwrap();
        let version = self.version.load(Ordering::Acquire);
        *pins.entry(version).or_insert(0) += 1;
        version
    }

    fn unpin(&self, version: u64) {
        let mut pins = self.pins.lock().unwrap();
        if let Some(count) = pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version);
            }
        }
    }

    /// The oldest snapshot any current or future reader may observe.
    fn oldest_readable(&self) -> u64 {
        let head = self.version.load(Ordering::Acquire);
        self.pins
            .lock()
            .unwrap()
            .keys()
            .next()
            .map_or(head, |oldest| (*oldest).min(head))
    }

    /// Inserts a brand-new node at the head of all five chains. Must be
    /// called with the transaction lock held. The node's backward links are
    /// fully set before any head points at it, so concurrent readers never
    /// observe a half-linked node.
    fn link_node(&self, node: &Arc<StatementNode>) {
        {
            let mut head = self.all_head.lock().unwrap();
            *node.previous.lock().unwrap() = head.take();
            *head = Some(Arc::clone(node));
        }
        Self::link_keyed(&self.subject_heads, node.statement.subject, node, |n| {
            &n.previous_subject
        });
        Self::link_keyed(&self.predicate_heads, node.statement.predicate, node, |n| {
            &n.previous_predicate
        });
        Self::link_keyed(&self.object_heads, node.statement.object, node, |n| {
            &n.previous_object
        });
        Self::link_keyed(&self.context_heads, node.statement.context, node, |n| {
            &n.previous_context
        });
    }

    fn link_keyed<K: Eq + std::hash::Hash>(
        map: &DashMap<K, ChainHead, FxBuild>,
        key: K,
        node: &Arc<StatementNode>,
        link: LinkAccessor,
    ) {
        match map.entry(key) {
            Entry::Occupied(mut entry) => {
                let head = entry.get_mut();
                *link(node).lock().unwrap() = Some(Arc::clone(&head.node));
                head.node = Arc::clone(node);
                head.count += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(ChainHead {
                    node: Arc::clone(node),
                    count: 1,
                });
            }
        }
    }

    /// Physically removes a node from the set and all five chains. Must be
    /// called with the transaction lock held. Idempotent.
    fn detach_node(&self, node: &Arc<StatementNode>) {
        if self.statements.remove(&node.statement).is_none() {
            return;
        }
        {
            let mut head = self.all_head.lock().unwrap();
            Self::unlink(&mut head, node, |n| &n.previous);
        }
        Self::unlink_keyed(&self.subject_heads, &node.statement.subject, node, |n| {
            &n.previous_subject
        });
        Self::unlink_keyed(&self.predicate_heads, &node.statement.predicate, node, |n| {
            &n.previous_predicate
        });
        Self::unlink_keyed(&self.object_heads, &node.statement.object, node, |n| {
            &n.previous_object
        });
        Self::unlink_keyed(&self.context_heads, &node.statement.context, node, |n| {
            &n.previous_context
        });
    }

    fn unlink(
        head: &mut Option<Arc<StatementNode>>,
        node: &Arc<StatementNode>,
        link: LinkAccessor,
    ) {
        let Some(first) = head else {
            return;
        };
        if Arc::ptr_eq(first, node) {
            *head = link(node).lock().unwrap().clone();
            return;
        }
        let mut current = Arc::clone(first);
        loop {
            let next = link(&current).lock().unwrap().clone();
            match next {
                Some(next) if Arc::ptr_eq(&next, node) => {
                    *link(&current).lock().unwrap() = link(node).lock().unwrap().clone();
                    return;
                }
                Some(next) => current = next,
                None => return,
            }
        }
    }

    fn unlink_keyed<K: Eq + std::hash::Hash>(
        map: &DashMap<K, ChainHead, FxBuild>,
        key: &K,
        node: &Arc<StatementNode>,
        link: LinkAccessor,
    ) {
        let emptied = {
            let Some(mut entry) = map.get_mut(key) else {
                return;
            };
            let head = entry.value_mut();
            head.count = head.count.saturating_sub(1);
            if Arc::ptr_eq(&head.node, node) {
                match link(node).lock().unwrap().clone() {
                    Some(previous) => {
                        head.node = previous;
                        false
                    }
                    None => true,
                }
            } else {
                let mut fake_head = Some(Arc::clone(&head.node));
                Self::unlink(&mut fake_head, node, link);
                false
            }
        };
        if emptied {
            map.remove(key);
        }
    }

    pub(crate) fn try_write_lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.writer
            .try_lock()
            .map_err(|_| StorageError::TransactionActive)
    }

    pub(crate) fn head_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    /// Inserts a statement during a bulk load, merging with an existing node
    /// when present. Must be called with the transaction lock held and
    /// `version` unpublished.
    pub(crate) fn bulk_insert(
        &self,
        statement: InternedStatement,
        explicit: bool,
        version: u64,
    ) -> BulkInserted {
        if let Some(node) = self
            .statements
            .get(&statement)
            .map(|entry| Arc::clone(entry.key()))
        {
            let mut lifecycle = node.lifecycle.lock().unwrap();
            if explicit {
                lifecycle.explicit = true;
            }
            if lifecycle.versions.contains(version) {
                BulkInserted::Unchanged
            } else {
                lifecycle.versions.add(version);
                drop(lifecycle);
                BulkInserted::Reopened(node)
            }
        } else {
            let node = Arc::new(StatementNode {
                statement,
                lifecycle: Mutex::new(StatementLifecycle {
                    versions: VersionRange::Start(version),
                    status: TxnStatus::Neutral,
                    explicit,
                }),
                previous: Mutex::new(None),
                previous_subject: Mutex::new(None),
                previous_predicate: Mutex::new(None),
                previous_object: Mutex::new(None),
                previous_context: Mutex::new(None),
            });
            self.link_node(&node);
            self.statements.insert(Arc::clone(&node));
            BulkInserted::Created(node)
        }
    }

    pub(crate) fn undo_bulk_insert(&self, inserted: BulkInserted, version: u64) {
        match inserted {
            BulkInserted::Created(node) => self.detach_node(&node),
            BulkInserted::Reopened(node) => {
                node.lifecycle.lock().unwrap().versions.remove(version);
            }
            BulkInserted::Unchanged => {}
        }
    }

    /// See [`MemoryStore::compact`]. Requires the transaction lock.
    pub(crate) fn compact(&self) {
        let oldest = self.oldest_readable();

        // Collect newest-first by walking the full chain.
        let mut nodes = Vec::with_capacity(self.statements.len());
        {
            let head = self.all_head.lock().unwrap();
            let mut current = head.clone();
            while let Some(node) = current {
                current = node.previous.lock().unwrap().clone();
                nodes.push(node);
            }
        }

        let mut survivors = Vec::with_capacity(nodes.len());
        let mut expired = Vec::new();
        for node in nodes {
            let lifecycle = node.lifecycle.lock().unwrap();
            if lifecycle.status == TxnStatus::Neutral && lifecycle.versions.expired_before(oldest) {
                drop(lifecycle);
                expired.push(node);
            } else {
                drop(lifecycle);
                survivors.push(node);
            }
        }
        if expired.is_empty() {
            return;
        }

        // Relink survivors oldest-first so every rewritten backward link
        // points at an already-rewritten node. Expired nodes keep their old
        // links, so a reader that entered a chain before the rewrite still
        // reaches every surviving statement.
        let mut last_all: Option<Arc<StatementNode>> = None;
        let mut last_subject: FxHashMap<ValueId, Arc<StatementNode>> = FxHashMap::default();
        let mut last_predicate: FxHashMap<ValueId, Arc<StatementNode>> = FxHashMap::default();
        let mut last_object: FxHashMap<ValueId, Arc<StatementNode>> = FxHashMap::default();
        let mut last_context: FxHashMap<Option<ValueId>, Arc<StatementNode>> =
            FxHashMap::default();
        let mut subject_counts: FxHashMap<ValueId, u64> = FxHashMap::default();
        let mut predicate_counts: FxHashMap<ValueId, u64> = FxHashMap::default();
        let mut object_counts: FxHashMap<ValueId, u64> = FxHashMap::default();
        let mut context_counts: FxHashMap<Option<ValueId>, u64> = FxHashMap::default();
        for node in survivors.iter().rev() {
            *node.previous.lock().unwrap() = last_all.replace(Arc::clone(node));
            *node.previous_subject.lock().unwrap() =
                last_subject.insert(node.statement.subject, Arc::clone(node));
            *node.previous_predicate.lock().unwrap() =
                last_predicate.insert(node.statement.predicate, Arc::clone(node));
            *node.previous_object.lock().unwrap() =
                last_object.insert(node.statement.object, Arc::clone(node));
            *node.previous_context.lock().unwrap() =
                last_context.insert(node.statement.context, Arc::clone(node));
            *subject_counts.entry(node.statement.subject).or_insert(0) += 1;
            *predicate_counts.entry(node.statement.predicate).or_insert(0) += 1;
            *object_counts.entry(node.statement.object).or_insert(0) += 1;
            *context_counts.entry(node.statement.context).or_insert(0) += 1;
        }
        *self.all_head.lock().unwrap() = last_all;
        Self::replace_heads(&self.subject_heads, last_subject, &subject_counts);
        Self::replace_heads(&self.predicate_heads, last_predicate, &predicate_counts);
        Self::replace_heads(&self.object_heads, last_object, &object_counts);
        Self::replace_heads(&self.context_heads, last_context, &context_counts);

        for node in &expired {
            self.statements.remove(&node.statement);
        }

        let mut referenced = FxHashSet::default();
        for node in &survivors {
            referenced.insert(node.statement.subject);
            referenced.insert(node.statement.predicate);
            referenced.insert(node.statement.object);
            if let Some(context) = node.statement.context {
                referenced.insert(context);
            }
        }
        self.registry.sweep(&referenced);

        debug!(
            removed = expired.len(),
            remaining = survivors.len(),
            oldest_snapshot = oldest,
            "compacted statement index"
        );
    }

    fn replace_heads<K: Eq + std::hash::Hash + Clone>(
        map: &DashMap<K, ChainHead, FxBuild>,
        new_heads: FxHashMap<K, Arc<StatementNode>>,
        counts: &FxHashMap<K, u64>,
    ) {
        map.retain(|key, _| new_heads.contains_key(key));
        for (key, node) in new_heads {
            let count = counts.get(&key).copied().unwrap_or(0);
            map.insert(key, ChainHead { node, count });
        }
    }
}

/// Builds a chain scan for a pattern of already-resolved value ids. Every
/// bound component whose value is unknown to the registry short-circuits to
/// an empty scan before this is called.
fn build_scan(
    content: &Content,
    subject: Option<ValueId>,
    predicate: Option<ValueId>,
    object: Option<ValueId>,
    contexts: Option<Vec<Option<ValueId>>>,
    snapshot: u64,
    mode: ReadMode,
    explicit_only: bool,
) -> NodeScan {
    // Walk the shortest applicable chain.
    let mut best: Option<(ChainKind, Arc<StatementNode>, u64)> = None;
    let mut consider = |kind: ChainKind, head: Option<(Arc<StatementNode>, u64)>| -> bool {
        match head {
            // A bound component without a chain cannot match anything.
            None => false,
            Some((node, count)) => {
                if best.as_ref().map_or(true, |(_, _, best_count)| count < *best_count) {
                    best = Some((kind, node, count));
                }
                true
            }
        }
    };
    let lookup = |map: &DashMap<ValueId, ChainHead, FxBuild>, key: ValueId| {
        map.get(&key)
            .map(|entry| (Arc::clone(&entry.node), entry.count))
    };
    if let Some(subject) = subject {
        if !consider(ChainKind::Subject, lookup(&content.subject_heads, subject)) {
            return NodeScan::empty();
        }
    }
    if let Some(predicate) = predicate {
        if !consider(ChainKind::Predicate, lookup(&content.predicate_heads, predicate)) {
            return NodeScan::empty();
        }
    }
    if let Some(object) = object {
        if !consider(ChainKind::Object, lookup(&content.object_heads, object)) {
            return NodeScan::empty();
        }
    }
    if let Some(contexts) = &contexts {
        if let [context] = contexts.as_slice() {
            let head = content
                .context_heads
                .get(context)
                .map(|entry| (Arc::clone(&entry.node), entry.count));
            if !consider(ChainKind::Context, head) {
                return NodeScan::empty();
            }
        }
    }

    let (kind, head) = match best {
        Some((kind, node, _)) => (kind, Some(node)),
        None => (ChainKind::All, content.all_head.lock().unwrap().clone()),
    };
    NodeScan {
        current: head,
        kind,
        expect_subject: subject,
        expect_predicate: predicate,
        expect_object: object,
        expect_contexts: contexts,
        snapshot,
        mode,
        explicit_only,
    }
}

/// Resolved pattern components, or `None` when a bound term is unknown to
/// the store and the pattern can match nothing.
type ResolvedPattern = (
    Option<ValueId>,
    Option<ValueId>,
    Option<ValueId>,
    Option<Vec<Option<ValueId>>>,
);

fn resolve_pattern(
    registry: &MemValueRegistry,
    subject: Option<SubjectRef<'_>>,
    predicate: Option<NamedNodeRef<'_>>,
    object: Option<TermRef<'_>>,
    contexts: Option<&[GraphNameRef<'_>]>,
) -> Option<ResolvedPattern> {
    let subject = match subject {
        Some(s) => Some(registry.try_get_subject(s)?),
        None => None,
    };
    let predicate = match predicate {
        Some(p) => Some(registry.try_get(TermRef::NamedNode(p))?),
        None => None,
    };
    let object = match object {
        Some(o) => Some(registry.try_get(o)?),
        None => None,
    };
    let contexts = match contexts {
        // An empty context list is a wildcard.
        None | Some([]) => None,
        Some(contexts) => {
            let resolved: Vec<Option<ValueId>> = contexts
                .iter()
                .filter_map(|context| registry.try_get_context(*context))
                .collect();
            if resolved.is_empty() {
                return None;
            }
            Some(resolved)
        }
    };
    Some((subject, predicate, object, contexts))
}

/// A consistent view of the store, pinned to one snapshot version.
///
/// Readers are cheap to clone; each clone holds its own pin. The pinned
/// version stays reclaimable-from only after every reader (and every
/// iterator created from one) is dropped.
#[derive(Debug)]
pub struct MemStoreReader {
    content: Arc<Content>,
    snapshot: u64,
    mode: ReadMode,
}

impl MemStoreReader {
    fn new(content: Arc<Content>, snapshot: u64, mode: ReadMode) -> Self {
        content.pin(snapshot);
        Self {
            content,
            snapshot,
            mode,
        }
    }

    /// A reader pinned atomically to the currently published version.
    fn pinned_at_head(content: Arc<Content>, mode: ReadMode) -> Self {
        let snapshot = content.pin_current();
        Self {
            content,
            snapshot,
            mode,
        }
    }

    /// The snapshot version this reader observes.
    pub fn version(&self) -> u64 {
        self.snapshot
    }

    /// Scans the statements matching the given pattern. `None` components
    /// are wildcards; a `contexts` list restricts matches to the listed
    /// contexts, with [`GraphNameRef::DefaultGraph`] standing for "no
    /// context". With `explicit_only`, inferred statements are skipped.
    pub fn statements(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        contexts: Option<&[GraphNameRef<'_>]>,
        explicit_only: bool,
    ) -> MemStatementIter {
        let scan = match resolve_pattern(&self.content.registry, subject, predicate, object, contexts)
        {
            Some((subject, predicate, object, contexts)) => build_scan(
                &self.content,
                subject,
                predicate,
                object,
                contexts,
                self.snapshot,
                self.mode,
                explicit_only,
            ),
            None => NodeScan::empty(),
        };
        MemStatementIter {
            scan,
            reader: self.clone(),
        }
    }

    pub fn contains(&self, quad: QuadRef<'_>) -> bool {
        self.statements(
            Some(quad.subject),
            Some(quad.predicate),
            Some(quad.object),
            Some(&[quad.graph_name]),
            false,
        )
        .next()
        .is_some()
    }

    /// Number of statements visible to this reader.
    pub fn len(&self) -> usize {
        self.statements(None, None, None, None, false).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes every visible statement and every namespace declaration into
    /// `handler`, bracketed by `start`/`end`.
    pub fn export(
        &self,
        handler: &mut dyn quadmem_common::StatementHandler,
        explicit_only: bool,
    ) -> Result<(), StorageError> {
        handler.start()?;
        for namespace in self.content.namespaces.iter() {
            handler.handle_namespace(namespace.prefix(), namespace.iri())?;
        }
        for statement in self.statements(None, None, None, None, explicit_only) {
            handler.handle_statement(statement.quad().as_ref())?;
        }
        handler.end()
    }

    pub(crate) fn decode_node(
        &self,
        node: &StatementNode,
    ) -> Result<Statement, CorruptionError> {
        let registry = &self.content.registry;
        let quad = Quad::new(
            registry.resolve_subject(node.statement.subject)?,
            registry.resolve_predicate(node.statement.predicate)?,
            registry.resolve(node.statement.object)?,
            registry.resolve_context(node.statement.context)?,
        );
        let explicit = node.lifecycle.lock().unwrap().explicit;
        Ok(Statement::new(quad, explicit))
    }
}

impl Clone for MemStoreReader {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.content), self.snapshot, self.mode)
    }
}

impl Drop for MemStoreReader {
    fn drop(&mut self) {
        self.content.unpin(self.snapshot);
    }
}

impl QuadPatternSource for MemStoreReader {
    fn quads_for_pattern(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        contexts: Option<&[GraphNameRef<'_>]>,
    ) -> Box<dyn Iterator<Item = Quad> + Send> {
        Box::new(
            self.statements(subject, predicate, object, contexts, false)
                .map(Statement::into_quad),
        )
    }
}

/// An open write transaction. At most one exists per store at a time.
///
/// Changes stay invisible to committed readers until [`commit`], which
/// publishes all of them with one atomic version bump. Dropping the guard
/// without committing rolls back.
///
/// [`commit`]: MemTransaction::commit
pub struct MemTransaction<'a> {
    store: &'a MemoryStore,
    _guard: MutexGuard<'a, ()>,
    /// Nodes whose status left `Neutral` in this transaction, in first-touch
    /// order. A node appears at most once per status excursion.
    touched: Vec<Arc<StatementNode>>,
    finished: bool,
}

impl<'a> MemTransaction<'a> {
    fn content(&self) -> &'a Content {
        &self.store.content
    }

    fn head(&self) -> u64 {
        self.content().version.load(Ordering::Relaxed)
    }

    /// Adds a statement. Returns whether the store's transaction-preview
    /// state changed. Re-adding a statement that an earlier commit removed
    /// opens a second visibility interval; the earlier one stays readable
    /// for old snapshots.
    pub fn add_statement(&mut self, quad: QuadRef<'_>, explicit: bool) -> bool {
        let content = self.content();
        let statement = InternedStatement {
            subject: content.registry.intern_subject(quad.subject),
            predicate: content.registry.intern_predicate(quad.predicate),
            object: content.registry.intern(quad.object),
            context: content.registry.intern_context(quad.graph_name),
        };

        if let Some(node) = content
            .statements
            .get(&statement)
            .map(|entry| Arc::clone(entry.key()))
        {
            let head = self.head();
            let mut newly_touched = false;
            let changed = {
                let mut lifecycle = node.lifecycle.lock().unwrap();
                match lifecycle.status {
                    TxnStatus::Zombie => {
                        lifecycle.status = TxnStatus::New;
                        lifecycle.explicit = explicit;
                        true
                    }
                    TxnStatus::New => {
                        if explicit && !lifecycle.explicit {
                            lifecycle.explicit = true;
                            true
                        } else {
                            false
                        }
                    }
                    TxnStatus::Deprecated => {
                        // Cancel the pending removal; disagreeing explicit
                        // flags turn into a pending flip.
                        lifecycle.status = if explicit == lifecycle.explicit {
                            TxnStatus::Neutral
                        } else if explicit {
                            TxnStatus::Explicit
                        } else {
                            TxnStatus::Inferred
                        };
                        true
                    }
                    TxnStatus::Explicit => false,
                    TxnStatus::Inferred => {
                        if explicit {
                            lifecycle.status = TxnStatus::Neutral;
                            true
                        } else {
                            false
                        }
                    }
                    TxnStatus::Neutral => {
                        if lifecycle.versions.contains(head) {
                            if explicit && !lifecycle.explicit {
                                lifecycle.status = TxnStatus::Explicit;
                                newly_touched = true;
                                true
                            } else {
                                false
                            }
                        } else {
                            // Committed-removed; re-assert.
                            lifecycle.status = TxnStatus::New;
                            lifecycle.explicit = explicit;
                            newly_touched = true;
                            true
                        }
                    }
                }
            };
            if newly_touched {
                self.touched.push(node);
            }
            changed
        } else {
            let node = Arc::new(StatementNode {
                statement,
                lifecycle: Mutex::new(StatementLifecycle {
                    versions: VersionRange::Empty,
                    status: TxnStatus::New,
                    explicit,
                }),
                previous: Mutex::new(None),
                previous_subject: Mutex::new(None),
                previous_predicate: Mutex::new(None),
                previous_object: Mutex::new(None),
                previous_context: Mutex::new(None),
            });
            content.link_node(&node);
            content.statements.insert(Arc::clone(&node));
            self.touched.push(node);
            true
        }
    }

    /// Marks every statement matching the pattern for removal. With
    /// `explicit_only`, inferred statements are left alone. Returns the
    /// number of statements affected.
    pub fn remove_statements(
        &mut self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        contexts: Option<&[GraphNameRef<'_>]>,
        explicit_only: bool,
    ) -> usize {
        let head = self.head();
        let scan = match resolve_pattern(
            &self.content().registry,
            subject,
            predicate,
            object,
            contexts,
        ) {
            Some((subject, predicate, object, contexts)) => build_scan(
                self.content(),
                subject,
                predicate,
                object,
                contexts,
                head,
                ReadMode::Transaction,
                explicit_only,
            ),
            None => NodeScan::empty(),
        };

        let mut removed = 0;
        for node in scan {
            let mut newly_touched = false;
            {
                let mut lifecycle = node.lifecycle.lock().unwrap();
                match lifecycle.status {
                    TxnStatus::Neutral => {
                        lifecycle.status = TxnStatus::Deprecated;
                        newly_touched = true;
                    }
                    TxnStatus::New => lifecycle.status = TxnStatus::Zombie,
                    TxnStatus::Inferred => lifecycle.status = TxnStatus::Deprecated,
                    TxnStatus::Explicit => {
                        // Cancel the pending upgrade; with an unrestricted
                        // removal the statement goes away entirely.
                        lifecycle.status = if explicit_only {
                            TxnStatus::Neutral
                        } else {
                            TxnStatus::Deprecated
                        };
                    }
                    TxnStatus::Deprecated | TxnStatus::Zombie => continue,
                }
            }
            if newly_touched {
                self.touched.push(node);
            }
            removed += 1;
        }
        removed
    }

    /// Removes one exact statement. Returns whether it was present.
    pub fn remove(&mut self, quad: QuadRef<'_>) -> bool {
        self.remove_statements(
            Some(quad.subject),
            Some(quad.predicate),
            Some(quad.object),
            Some(&[quad.graph_name]),
            false,
        ) > 0
    }

    /// Removes every statement, or every statement in the given contexts.
    pub fn clear(&mut self, contexts: Option<&[GraphNameRef<'_>]>) -> usize {
        self.remove_statements(None, None, None, contexts, false)
    }

    /// A reader previewing the state this transaction would produce if it
    /// committed now.
    pub fn reader(&self) -> MemStoreReader {
        MemStoreReader::new(
            Arc::clone(&self.store.content),
            self.head(),
            ReadMode::Transaction,
        )
    }

    /// Publishes every pending change with a single version bump. Readers
    /// observe either none of this transaction's changes or all of them.
    pub fn commit(mut self) {
        let store = self.store;
        let content = &store.content;
        let next = self.head() + 1;
        let mut changed = false;
        for node in take(&mut self.touched) {
            let detach = {
                let mut lifecycle = node.lifecycle.lock().unwrap();
                match lifecycle.status {
                    TxnStatus::Neutral => false,
                    TxnStatus::New => {
                        lifecycle.versions.add(next);
                        lifecycle.status = TxnStatus::Neutral;
                        changed = true;
                        false
                    }
                    TxnStatus::Deprecated => {
                        lifecycle.versions.remove(next);
                        lifecycle.status = TxnStatus::Neutral;
                        changed = true;
                        false
                    }
                    TxnStatus::Explicit => {
                        lifecycle.explicit = true;
                        lifecycle.status = TxnStatus::Neutral;
                        changed = true;
                        false
                    }
                    TxnStatus::Inferred => {
                        lifecycle.explicit = false;
                        lifecycle.status = TxnStatus::Neutral;
                        changed = true;
                        false
                    }
                    TxnStatus::Zombie => {
                        // Added and removed in this transaction, so never
                        // visible; drop it unless it carries visibility
                        // history from older commits.
                        if lifecycle.versions == VersionRange::Empty {
                            true
                        } else {
                            lifecycle.status = TxnStatus::Neutral;
                            false
                        }
                    }
                }
            };
            if detach {
                content.detach_node(&node);
            }
        }
        if changed {
            content.version.store(next, Ordering::Release);
            debug!(version = next, "committed transaction");
        }
        self.finished = true;
    }

    /// Discards every pending change. The committed state is untouched.
    pub fn rollback(mut self) {
        self.do_rollback();
        self.finished = true;
    }

    fn do_rollback(&mut self) {
        let content = self.content();
        let mut dropped = 0usize;
        for node in take(&mut self.touched) {
            let detach = {
                let mut lifecycle = node.lifecycle.lock().unwrap();
                match lifecycle.status {
                    TxnStatus::New | TxnStatus::Zombie => {
                        if lifecycle.versions == VersionRange::Empty {
                            true
                        } else {
                            lifecycle.status = TxnStatus::Neutral;
                            false
                        }
                    }
                    TxnStatus::Deprecated | TxnStatus::Explicit | TxnStatus::Inferred => {
                        lifecycle.status = TxnStatus::Neutral;
                        false
                    }
                    TxnStatus::Neutral => false,
                }
            };
            if detach {
                content.detach_node(&node);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "rolled back transaction");
        }
    }
}

impl Drop for MemTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.do_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadmem_model::NamedNode;

    fn named(suffix: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("http://example.com/{suffix}"))
    }

    fn quad(s: &str, p: &str, o: &str) -> Quad {
        Quad::new(named(s), named(p), named(o), quadmem_model::GraphName::DefaultGraph)
    }

    #[test]
    fn test_add_and_read_back() {
        let store = MemoryStore::new();
        let q = quad("s", "p", "o");
        store
            .transaction(|txn| {
                assert!(txn.add_statement(q.as_ref(), true));
                // Duplicate within the same transaction is a no-op.
                assert!(!txn.add_statement(q.as_ref(), true));
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert!(store.contains(q.as_ref()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_uncommitted_changes_are_invisible() {
        let store = MemoryStore::new();
        let q = quad("s", "p", "o");
        let txn = {
            let mut txn = store.begin().unwrap();
            txn.add_statement(q.as_ref(), true);
            assert!(!store.contains(q.as_ref()));
            assert!(txn.reader().contains(q.as_ref()));
            txn
        };
        txn.rollback();
        assert!(!store.contains(q.as_ref()));
        assert_eq!(store.raw_reader().len(), 0);
    }

    #[test]
    fn test_snapshot_isolation_across_commit() {
        let store = MemoryStore::new();
        let q1 = quad("s", "p", "o1");
        let q2 = quad("s", "p", "o2");
        store
            .transaction(|txn| {
                txn.add_statement(q1.as_ref(), true);
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let old = store.snapshot();
        store
            .transaction(|txn| {
                txn.add_statement(q2.as_ref(), true);
                txn.remove(q1.as_ref());
                Ok::<_, StorageError>(())
            })
            .unwrap();

        // The pinned reader still sees the old state.
        assert!(old.contains(q1.as_ref()));
        assert!(!old.contains(q2.as_ref()));
        // A fresh reader sees the new state.
        let new = store.snapshot();
        assert!(!new.contains(q1.as_ref()));
        assert!(new.contains(q2.as_ref()));
    }

    #[test]
    fn test_only_one_transaction_at_a_time() {
        let store = MemoryStore::new();
        let txn = store.begin().unwrap();
        assert!(matches!(
            store.begin(),
            Err(StorageError::TransactionActive)
        ));
        drop(txn);
        assert!(store.begin().is_ok());
    }

    #[test]
    fn test_add_remove_same_transaction_leaves_nothing() {
        let store = MemoryStore::new();
        let q = quad("s", "p", "o");
        store
            .transaction(|txn| {
                txn.add_statement(q.as_ref(), true);
                assert!(txn.remove(q.as_ref()));
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert!(!store.contains(q.as_ref()));
        // The zombie node was physically dropped.
        assert_eq!(store.raw_reader().len(), 0);
        assert_eq!(store.current_snapshot(), 0);
    }

    #[test]
    fn test_reassertion_keeps_old_interval_readable() {
        let store = MemoryStore::new();
        let q = quad("s", "p", "o");
        store
            .transaction(|txn| {
                txn.add_statement(q.as_ref(), true);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        let first = store.snapshot();

        store
            .transaction(|txn| {
                txn.remove(q.as_ref());
                Ok::<_, StorageError>(())
            })
            .unwrap();
        let removed = store.snapshot();

        store
            .transaction(|txn| {
                assert!(txn.add_statement(q.as_ref(), true));
                Ok::<_, StorageError>(())
            })
            .unwrap();

        assert!(first.contains(q.as_ref()));
        assert!(!removed.contains(q.as_ref()));
        assert!(store.contains(q.as_ref()));
        // One physical node carries all three views.
        assert_eq!(store.raw_reader().len(), 1);
    }

    #[test]
    fn test_explicit_upgrade_and_downgrade() {
        let store = MemoryStore::new();
        let q = quad("s", "p", "o");
        store
            .transaction(|txn| {
                txn.add_statement(q.as_ref(), false);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        let reader = store.snapshot();
        assert_eq!(reader.statements(None, None, None, None, true).count(), 0);
        assert_eq!(reader.statements(None, None, None, None, false).count(), 1);

        store
            .transaction(|txn| {
                assert!(txn.add_statement(q.as_ref(), true));
                // Already pending explicit.
                assert!(!txn.add_statement(q.as_ref(), true));
                Ok::<_, StorageError>(())
            })
            .unwrap();
        let reader = store.snapshot();
        assert_eq!(reader.statements(None, None, None, None, true).count(), 1);
    }

    #[test]
    fn test_pattern_scan_uses_bound_components() {
        let store = MemoryStore::new();
        store
            .transaction(|txn| {
                for i in 0..10 {
                    txn.add_statement(quad(&format!("s{i}"), "p", &format!("o{}", i % 3)).as_ref(), true);
                }
                Ok::<_, StorageError>(())
            })
            .unwrap();
        let reader = store.snapshot();
        let s3 = named("s3");
        assert_eq!(
            reader
                .statements(Some(s3.as_ref().into()), None, None, None, false)
                .count(),
            1
        );
        let o0 = named("o0");
        assert_eq!(
            reader
                .statements(None, None, Some(o0.as_ref().into()), None, false)
                .count(),
            4
        );
        let unknown = named("nowhere");
        assert_eq!(
            reader
                .statements(Some(unknown.as_ref().into()), None, None, None, false)
                .count(),
            0
        );
    }

    #[test]
    fn test_snapshot_pins_the_version_it_observes() {
        let store = MemoryStore::new();
        let q = quad("s", "p", "o");
        store
            .transaction(|txn| {
                txn.add_statement(q.as_ref(), true);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.version(), store.current_snapshot());

        store
            .transaction(|txn| {
                txn.remove(q.as_ref());
                Ok::<_, StorageError>(())
            })
            .unwrap();
        store.compact();
        assert!(snapshot.contains(q.as_ref()));
    }

    #[test]
    fn test_compact_drops_unreachable_history() {
        let store = MemoryStore::new();
        let q1 = quad("s", "p", "o1");
        let q2 = quad("s", "p", "o2");
        store
            .transaction(|txn| {
                txn.add_statement(q1.as_ref(), true);
                txn.add_statement(q2.as_ref(), true);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        // While a reader pins the old snapshot, nothing may be reclaimed.
        let pinned = store.snapshot();
        store
            .transaction(|txn| {
                txn.remove(q1.as_ref());
                Ok::<_, StorageError>(())
            })
            .unwrap();
        store.compact();
        assert_eq!(store.raw_reader().len(), 2);
        assert!(pinned.contains(q1.as_ref()));
        drop(pinned);

        store.compact();
        assert_eq!(store.raw_reader().len(), 1);
        assert!(store.contains(q2.as_ref()));
    }

    #[test]
    fn test_random_operations_match_model() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(42);
        let store = MemoryStore::new();
        let mut model = std::collections::HashSet::new();
        for _ in 0..50 {
            store
                .transaction(|txn| {
                    for _ in 0..20 {
                        let q = quad(
                            &format!("s{}", rng.random_range(0..10)),
                            "p",
                            &format!("o{}", rng.random_range(0..10)),
                        );
                        if rng.random_bool(0.6) {
                            txn.add_statement(q.as_ref(), true);
                            model.insert(q);
                        } else {
                            txn.remove(q.as_ref());
                            model.remove(&q);
                        }
                    }
                    Ok::<_, StorageError>(())
                })
                .unwrap();
        }
        store.compact();
        let visible: std::collections::HashSet<Quad> = store
            .snapshot()
            .statements(None, None, None, None, false)
            .map(Statement::into_quad)
            .collect();
        assert_eq!(visible, model);
    }

    #[test]
    fn test_clear_contexts() {
        let store = MemoryStore::new();
        let g = named("g");
        let in_graph = Quad::new(named("s"), named("p"), named("o"), g.clone());
        let in_default = quad("s", "p", "o");
        store
            .transaction(|txn| {
                txn.add_statement(in_graph.as_ref(), true);
                txn.add_statement(in_default.as_ref(), true);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        store
            .transaction(|txn| {
                assert_eq!(txn.clear(Some(&[g.as_ref().into()])), 1);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert!(!store.contains(in_graph.as_ref()));
        assert!(store.contains(in_default.as_ref()));
    }

    #[test]
    fn test_raw_scan_matches_naive_filter_for_every_pattern_shape() {
        let store = MemoryStore::new();
        let mut all = Vec::new();
        for s in 0..6 {
            for p in 0..5 {
                for o in 0..4 {
                    let graph = match (s + p + o) % 3 {
                        0 => quadmem_model::GraphName::DefaultGraph,
                        g => named(&format!("g{g}")).into(),
                    };
                    all.push(Quad::new(
                        named(&format!("s{s}")),
                        named(&format!("p{p}")),
                        named(&format!("o{o}")),
                        graph,
                    ));
                }
            }
        }
        assert!(all.len() >= 100);
        store
            .transaction(|txn| {
                for q in &all {
                    txn.add_statement(q.as_ref(), true);
                }
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let reader = store.raw_reader();
        let subject = named("s1");
        let predicate = named("p2");
        let object = named("o0");
        let graph = named("g1");
        for mask in 0..16u32 {
            let s = (mask & 1 != 0).then_some(&subject);
            let p = (mask & 2 != 0).then_some(&predicate);
            let o = (mask & 4 != 0).then_some(&object);
            let g = (mask & 8 != 0).then_some(&graph);

            let expected: std::collections::HashSet<Quad> = all
                .iter()
                .filter(|q| {
                    s.map_or(true, |s| q.subject.as_ref() == s.as_ref().into())
                        && p.map_or(true, |p| q.predicate == *p)
                        && o.map_or(true, |o| q.object.as_ref() == o.as_ref().into())
                        && g.map_or(true, |g| q.graph_name.as_ref() == g.as_ref().into())
                })
                .cloned()
                .collect();

            let contexts = g.map(|g| [GraphNameRef::from(g.as_ref())]);
            let actual: std::collections::HashSet<Quad> = reader
                .statements(
                    s.map(|s| s.as_ref().into()),
                    p.map(NamedNode::as_ref),
                    o.map(|o| o.as_ref().into()),
                    contexts.as_ref().map(<[GraphNameRef<'_>; 1]>::as_slice),
                    false,
                )
                .map(Statement::into_quad)
                .collect();
            assert_eq!(actual, expected, "pattern combination {mask}");
        }
    }
}
