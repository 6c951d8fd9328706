//! The query-plan representation consumed by the evaluator.
//!
//! Surface-syntax parsers live outside this crate; they hand the evaluator a
//! tree of these nodes. Evaluation dispatches on the node kind with a plain
//! exhaustive match.

use crate::expression::Expression;
use quadmem_model::{BlankNode, Literal, NamedNode, Term, Variable};

/// One position of a statement pattern: a constant term or a variable to be
/// bound by matching.
#[derive(Debug, Clone, PartialEq)]
pub enum TermPattern {
    Variable(Variable),
    Term(Term),
}

impl TermPattern {
    pub fn variable(&self) -> Option<&Variable> {
        match self {
            TermPattern::Variable(v) => Some(v),
            TermPattern::Term(_) => None,
        }
    }
}

impl From<Variable> for TermPattern {
    fn from(v: Variable) -> Self {
        TermPattern::Variable(v)
    }
}

impl From<Term> for TermPattern {
    fn from(t: Term) -> Self {
        TermPattern::Term(t)
    }
}

impl From<NamedNode> for TermPattern {
    fn from(n: NamedNode) -> Self {
        TermPattern::Term(n.into())
    }
}

impl From<BlankNode> for TermPattern {
    fn from(b: BlankNode) -> Self {
        TermPattern::Term(b.into())
    }
}

impl From<Literal> for TermPattern {
    fn from(l: Literal) -> Self {
        TermPattern::Term(l.into())
    }
}

/// A statement pattern leaf. A `context` of `None` matches statements in any
/// context; a context variable only matches statements carrying a context.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementPattern {
    pub subject: TermPattern,
    pub predicate: TermPattern,
    pub object: TermPattern,
    pub context: Option<TermPattern>,
}

impl StatementPattern {
    pub fn new(
        subject: impl Into<TermPattern>,
        predicate: impl Into<TermPattern>,
        object: impl Into<TermPattern>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<TermPattern>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// One ordering criterion of an [`TupleExpr::Order`] node, applied in stated
/// order with later elements breaking ties.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderElem {
    pub expression: Expression,
    pub descending: bool,
}

impl OrderElem {
    pub fn asc(expression: Expression) -> Self {
        Self {
            expression,
            descending: false,
        }
    }

    pub fn desc(expression: Expression) -> Self {
        Self {
            expression,
            descending: true,
        }
    }
}

/// An algebra node producing a sequence of solutions.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleExpr {
    Pattern(StatementPattern),
    Join(Box<TupleExpr>, Box<TupleExpr>),
    Union(Box<TupleExpr>, Box<TupleExpr>),
    Difference(Box<TupleExpr>, Box<TupleExpr>),
    Intersection(Box<TupleExpr>, Box<TupleExpr>),
    Distinct(Box<TupleExpr>),
    Order(Box<TupleExpr>, Vec<OrderElem>),
    Filter(Box<TupleExpr>, Expression),
    Extend(Box<TupleExpr>, Variable, Expression),
    /// Transitive closure of a one-step path expression.
    ///
    /// `path` is evaluated per step with `start` bound to the step's origin;
    /// the values it binds `end` to are the step's targets. `min_length` 0
    /// additionally relates every origin to itself.
    ArbitraryLengthPath {
        subject: TermPattern,
        path: Box<TupleExpr>,
        start: Variable,
        end: Variable,
        object: TermPattern,
        min_length: u32,
    },
    /// Exactly one empty solution.
    SingletonSet,
    /// No solutions.
    EmptySet,
}

impl TupleExpr {
    pub fn join(self, other: TupleExpr) -> Self {
        TupleExpr::Join(Box::new(self), Box::new(other))
    }

    pub fn union(self, other: TupleExpr) -> Self {
        TupleExpr::Union(Box::new(self), Box::new(other))
    }

    pub fn difference(self, other: TupleExpr) -> Self {
        TupleExpr::Difference(Box::new(self), Box::new(other))
    }

    pub fn intersection(self, other: TupleExpr) -> Self {
        TupleExpr::Intersection(Box::new(self), Box::new(other))
    }

    pub fn distinct(self) -> Self {
        TupleExpr::Distinct(Box::new(self))
    }

    pub fn order(self, elems: Vec<OrderElem>) -> Self {
        TupleExpr::Order(Box::new(self), elems)
    }

    pub fn filter(self, expression: Expression) -> Self {
        TupleExpr::Filter(Box::new(self), expression)
    }

    pub fn extend(self, variable: Variable, expression: Expression) -> Self {
        TupleExpr::Extend(Box::new(self), variable, expression)
    }

    /// The variables this expression can bind, in first-occurrence order.
    /// The internal step variables of a path node are not part of its
    /// output and are excluded.
    pub fn variables(&self) -> Vec<Variable> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<Variable>) {
        fn push(out: &mut Vec<Variable>, v: &Variable) {
            if !out.contains(v) {
                out.push(v.clone());
            }
        }
        fn push_pattern(out: &mut Vec<Variable>, p: &TermPattern) {
            if let Some(v) = p.variable() {
                push(out, v);
            }
        }
        match self {
            TupleExpr::Pattern(pattern) => {
                push_pattern(out, &pattern.subject);
                push_pattern(out, &pattern.predicate);
                push_pattern(out, &pattern.object);
                if let Some(context) = &pattern.context {
                    push_pattern(out, context);
                }
            }
            TupleExpr::Join(l, r)
            | TupleExpr::Union(l, r)
            | TupleExpr::Difference(l, r)
            | TupleExpr::Intersection(l, r) => {
                l.collect_variables(out);
                r.collect_variables(out);
            }
            TupleExpr::Distinct(inner) | TupleExpr::Order(inner, _) => {
                inner.collect_variables(out);
            }
            TupleExpr::Filter(inner, _) => inner.collect_variables(out),
            TupleExpr::Extend(inner, variable, _) => {
                inner.collect_variables(out);
                push(out, variable);
            }
            TupleExpr::ArbitraryLengthPath {
                subject, object, ..
            } => {
                push_pattern(out, subject);
                push_pattern(out, object);
            }
            TupleExpr::SingletonSet | TupleExpr::EmptySet => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_in_first_occurrence_order() {
        let x = Variable::new_unchecked("x");
        let y = Variable::new_unchecked("y");
        let p = NamedNode::new_unchecked("http://example.com/p");
        let expr = TupleExpr::Pattern(StatementPattern::new(
            x.clone(),
            p.clone(),
            y.clone(),
        ))
        .join(TupleExpr::Pattern(StatementPattern::new(
            y.clone(),
            p,
            x.clone(),
        )));
        assert_eq!(expr.variables(), vec![x, y]);
    }
}
