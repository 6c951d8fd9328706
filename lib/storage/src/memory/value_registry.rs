use dashmap::{DashMap, DashSet};
use quadmem_common::error::CorruptionError;
use quadmem_model::vocab::xsd;
use quadmem_model::{
    BlankNodeRef, GraphName, GraphNameRef, Literal, LiteralRef, NamedNodeRef, Subject, SubjectRef,
    Term, TermRef,
};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle of an interned value. Two handles are equal iff the values they
/// denote are RDF-equal, so statement matching compares ids instead of terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u64);

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
enum ValueKind {
    NamedNode,
    BlankNode,
    /// An `xsd:string` literal without language tag.
    SimpleLiteral,
    /// The second string is the language tag.
    LangLiteral,
    /// The second string is the datatype IRI.
    TypedLiteral,
}

#[derive(Debug, Hash, PartialEq, Eq, Clone)]
struct EncodedValue(ValueKind, Arc<str>, Option<Arc<str>>);

/// Interning arena for RDF values.
///
/// Strings are shared through their own interning set, so a long IRI that
/// occurs as both predicate and datatype is stored once. Safe for concurrent
/// readers plus the single writer.
#[derive(Debug)]
pub struct MemValueRegistry {
    next_id: AtomicU64,
    strings: DashSet<Arc<str>>,
    id2value: DashMap<ValueId, EncodedValue, BuildHasherDefault<FxHasher>>,
    value2id: DashMap<EncodedValue, ValueId, BuildHasherDefault<FxHasher>>,
}

impl MemValueRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            strings: DashSet::new(),
            id2value: DashMap::with_hasher(BuildHasherDefault::default()),
            value2id: DashMap::with_hasher(BuildHasherDefault::default()),
        }
    }

    fn intern_str(&self, value: &str) -> Arc<str> {
        match self.strings.get(value) {
            None => {
                let result = Arc::<str>::from(value);
                self.strings.insert(Arc::clone(&result));
                result
            }
            Some(entry) => Arc::clone(&entry),
        }
    }

    fn lookup_str(&self, value: &str) -> Option<Arc<str>> {
        self.strings.get(value).map(|entry| Arc::clone(&entry))
    }

    fn obtain_id(&self, encoded: EncodedValue) -> ValueId {
        match self.value2id.get(&encoded) {
            None => {
                let id = ValueId(self.next_id.fetch_add(1, Ordering::Relaxed));
                self.id2value.insert(id, encoded.clone());
                self.value2id.insert(encoded, id);
                id
            }
            Some(entry) => *entry.value(),
        }
    }

    fn encode(&self, term: TermRef<'_>) -> EncodedValue {
        match term {
            TermRef::NamedNode(n) => {
                EncodedValue(ValueKind::NamedNode, self.intern_str(n.as_str()), None)
            }
            TermRef::BlankNode(b) => {
                EncodedValue(ValueKind::BlankNode, self.intern_str(b.as_str()), None)
            }
            TermRef::Literal(lit) => self.encode_literal(lit),
        }
    }

    fn encode_literal(&self, lit: LiteralRef<'_>) -> EncodedValue {
        if let Some(language) = lit.language() {
            EncodedValue(
                ValueKind::LangLiteral,
                self.intern_str(lit.value()),
                Some(self.intern_str(language)),
            )
        } else if lit.datatype() == xsd::STRING {
            EncodedValue(ValueKind::SimpleLiteral, self.intern_str(lit.value()), None)
        } else {
            EncodedValue(
                ValueKind::TypedLiteral,
                self.intern_str(lit.value()),
                Some(self.intern_str(lit.datatype().as_str())),
            )
        }
    }

    /// Interns a term, creating the canonical entry on first occurrence.
    pub fn intern(&self, term: TermRef<'_>) -> ValueId {
        let encoded = self.encode(term);
        self.obtain_id(encoded)
    }

    pub fn intern_subject(&self, subject: SubjectRef<'_>) -> ValueId {
        self.intern(subject_as_term(subject))
    }

    pub fn intern_predicate(&self, predicate: NamedNodeRef<'_>) -> ValueId {
        self.intern(TermRef::NamedNode(predicate))
    }

    /// Interns a context. The default graph is the "no context" value and is
    /// represented as `None`.
    pub fn intern_context(&self, context: GraphNameRef<'_>) -> Option<ValueId> {
        match context {
            GraphNameRef::NamedNode(n) => Some(self.intern(TermRef::NamedNode(n))),
            GraphNameRef::BlankNode(b) => Some(self.intern(TermRef::BlankNode(b))),
            GraphNameRef::DefaultGraph => None,
        }
    }

    /// Looks a term up without creating it. `None` means the term has never
    /// been interned, so no stored statement can reference it.
    pub fn try_get(&self, term: TermRef<'_>) -> Option<ValueId> {
        let encoded = match term {
            TermRef::NamedNode(n) => {
                EncodedValue(ValueKind::NamedNode, self.lookup_str(n.as_str())?, None)
            }
            TermRef::BlankNode(b) => {
                EncodedValue(ValueKind::BlankNode, self.lookup_str(b.as_str())?, None)
            }
            TermRef::Literal(lit) => {
                if let Some(language) = lit.language() {
                    EncodedValue(
                        ValueKind::LangLiteral,
                        self.lookup_str(lit.value())?,
                        Some(self.lookup_str(language)?),
                    )
                } else if lit.datatype() == xsd::STRING {
                    EncodedValue(ValueKind::SimpleLiteral, self.lookup_str(lit.value())?, None)
                } else {
                    EncodedValue(
                        ValueKind::TypedLiteral,
                        self.lookup_str(lit.value())?,
                        Some(self.lookup_str(lit.datatype().as_str())?),
                    )
                }
            }
        };
        self.value2id.get(&encoded).map(|entry| *entry.value())
    }

    pub fn try_get_subject(&self, subject: SubjectRef<'_>) -> Option<ValueId> {
        self.try_get(subject_as_term(subject))
    }

    /// Looks up a context pattern. The outer `None` means the context is
    /// unknown to this store; `Some(None)` is the "no context" value.
    pub fn try_get_context(&self, context: GraphNameRef<'_>) -> Option<Option<ValueId>> {
        match context {
            GraphNameRef::NamedNode(n) => Some(Some(self.try_get(TermRef::NamedNode(n))?)),
            GraphNameRef::BlankNode(b) => Some(Some(self.try_get(TermRef::BlankNode(b))?)),
            GraphNameRef::DefaultGraph => Some(None),
        }
    }

    pub fn resolve(&self, id: ValueId) -> Result<Term, CorruptionError> {
        let encoded = self
            .id2value
            .get(&id)
            .ok_or_else(|| CorruptionError::msg("dangling value id in statement index"))?;
        Ok(match &*encoded {
            EncodedValue(ValueKind::NamedNode, iri, _) => {
                NamedNodeRef::new_unchecked(iri.as_ref()).into_owned().into()
            }
            EncodedValue(ValueKind::BlankNode, node_id, _) => {
                BlankNodeRef::new_unchecked(node_id.as_ref()).into_owned().into()
            }
            EncodedValue(ValueKind::SimpleLiteral, value, _) => {
                Literal::new_simple_literal(value.as_ref()).into()
            }
            EncodedValue(ValueKind::LangLiteral, value, Some(language)) => {
                Literal::new_language_tagged_literal_unchecked(value.as_ref(), language.as_ref())
                    .into()
            }
            EncodedValue(ValueKind::TypedLiteral, value, Some(datatype)) => {
                Literal::new_typed_literal(
                    value.as_ref(),
                    NamedNodeRef::new_unchecked(datatype.as_ref()).into_owned(),
                )
                .into()
            }
            EncodedValue(_, _, _) => {
                return Err(CorruptionError::msg("malformed interned value"));
            }
        })
    }

    pub fn resolve_subject(&self, id: ValueId) -> Result<Subject, CorruptionError> {
        match self.resolve(id)? {
            Term::NamedNode(n) => Ok(n.into()),
            Term::BlankNode(b) => Ok(b.into()),
            Term::Literal(_) => Err(CorruptionError::msg("literal in subject position")),
        }
    }

    pub fn resolve_predicate(&self, id: ValueId) -> Result<quadmem_model::NamedNode, CorruptionError> {
        match self.resolve(id)? {
            Term::NamedNode(n) => Ok(n),
            _ => Err(CorruptionError::msg("non-IRI in predicate position")),
        }
    }

    pub fn resolve_context(&self, id: Option<ValueId>) -> Result<GraphName, CorruptionError> {
        Ok(match id {
            None => GraphName::DefaultGraph,
            Some(id) => match self.resolve(id)? {
                Term::NamedNode(n) => n.into(),
                Term::BlankNode(b) => b.into(),
                Term::Literal(_) => {
                    return Err(CorruptionError::msg("literal in context position"));
                }
            },
        })
    }

    /// Drops every interned value whose id is not in `referenced`. Called by
    /// store compaction once the unreferenced statements are gone.
    pub(crate) fn sweep(&self, referenced: &rustc_hash::FxHashSet<ValueId>) {
        self.value2id.retain(|_, id| referenced.contains(id));
        self.id2value.retain(|id, _| referenced.contains(id));
        // Strings are cheap to keep; drop the ones no value uses anymore.
        self.strings.retain(|s| Arc::strong_count(s) > 1);
    }
}

impl Default for MemValueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn subject_as_term(subject: SubjectRef<'_>) -> TermRef<'_> {
    match subject {
        SubjectRef::NamedNode(n) => TermRef::NamedNode(n),
        SubjectRef::BlankNode(b) => TermRef::BlankNode(b),
    }
}
