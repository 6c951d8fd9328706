//! Query plans and their evaluation.
//!
//! Build a [`TupleExpr`] tree and hand it to [`Store::evaluate`] or run it
//! yourself through an [`EvaluationStrategy`] over any snapshot.
//!
//! [`Store::evaluate`]: crate::store::Store::evaluate

pub use quadmem_engine::eval::EvaluationBudget;
pub use quadmem_engine::functions::{builtin, Function};
pub use quadmem_engine::{
    drain_results, BindingIter, BindingSet, Comparator, EvaluationStrategy, Expression,
    ExpressionError, FunctionRegistry, OrderElem, QueryEvaluationError, QueryResultsHandler,
    StatementPattern, TermPattern, TupleExpr,
};
