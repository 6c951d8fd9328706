use quadmem_common::error::StorageError;

/// An error raised while evaluating a query plan. The store itself is
/// unaffected; the whole evaluation fails, never a silently truncated
/// result.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QueryEvaluationError {
    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An expression failed outside of a filter or bind position, where the
    /// error would have been recoverable.
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    /// A materializing operator exceeded the configured evaluation budget.
    #[error("query evaluation buffered more than {max_size} intermediate solutions")]
    SizeLimitExceeded { max_size: usize },
}

/// A typed, recoverable error from evaluating a value expression. Inside
/// `Filter` the affected binding is simply non-matching; inside `Extend` the
/// target variable stays unbound.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ExpressionError {
    #[error("variable ?{0} is not bound")]
    UnboundVariable(String),
    #[error("no function registered for <{0}>")]
    UnknownFunction(String),
    #[error("<{iri}> expects {expected} arguments, got {actual}")]
    Arity {
        iri: String,
        expected: usize,
        actual: usize,
    },
    #[error("{0}")]
    TypeMismatch(String),
    #[error("values cannot be compared")]
    Incomparable,
    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),
}
