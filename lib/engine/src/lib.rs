pub mod algebra;
pub mod binding;
pub mod error;
pub mod eval;
pub mod expression;
pub mod functions;

pub use algebra::{OrderElem, StatementPattern, TermPattern, TupleExpr};
pub use binding::{drain_results, BindingSet, QueryResultsHandler};
pub use error::{ExpressionError, QueryEvaluationError};
pub use eval::{BindingIter, EvaluationStrategy};
pub use expression::{Comparator, Expression};
pub use functions::FunctionRegistry;
