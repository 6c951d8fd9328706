use quadmem_model::{GraphNameRef, NamedNodeRef, Quad, SubjectRef, TermRef};

/// Pattern-scan abstraction the query engine evaluates statement patterns
/// through.
///
/// # Consistency
///
/// A query plan usually contains several patterns reading from the same
/// store. Implementations must pin all scans created from one value to the
/// same snapshot, so a query never observes a half-applied commit.
pub trait QuadPatternSource: Send + Sync {
    /// Returns a lazy, single-pass iterator over the statements matching the
    /// given pattern. `None` components are wildcards. A `contexts` value of
    /// `None` matches any context; an explicit list restricts matches to the
    /// listed contexts, where [`GraphNameRef::DefaultGraph`] stands for "no
    /// context" and is itself matchable.
    ///
    /// The iterator owns whatever it needs (typically a cloned reader with
    /// its snapshot pin), so it may outlive the source reference.
    fn quads_for_pattern(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        contexts: Option<&[GraphNameRef<'_>]>,
    ) -> Box<dyn Iterator<Item = Quad> + Send>;
}
