//! Value expressions and the SPARQL-style value comparisons used by
//! `Filter`, `Extend` and `Order`.

use crate::binding::BindingSet;
use crate::error::ExpressionError;
use crate::functions::FunctionRegistry;
use oxsdatatypes::{Boolean, Double, Integer};
use quadmem_model::vocab::xsd;
use quadmem_model::{Literal, NamedNode, Term, Variable};
use std::cmp::Ordering;
use std::str::FromStr;

/// A value expression over a solution.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Constant(Term),
    Variable(Variable),
    /// Three-valued: true wins over an error on either side.
    Or(Box<Expression>, Box<Expression>),
    /// Three-valued: false wins over an error on either side.
    And(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Compare(Box<Expression>, Comparator, Box<Expression>),
    Add(Box<Expression>, Box<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Box<Expression>, Box<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    /// Dispatched through the function registry by function IRI.
    FunctionCall(NamedNode, Vec<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expression {
    pub fn variable(name: &Variable) -> Self {
        Expression::Variable(name.clone())
    }

    pub fn constant(term: impl Into<Term>) -> Self {
        Expression::Constant(term.into())
    }

    pub fn compare(self, comparator: Comparator, other: Expression) -> Self {
        Expression::Compare(Box::new(self), comparator, Box::new(other))
    }

    pub fn evaluate(
        &self,
        bindings: &BindingSet,
        functions: &FunctionRegistry,
    ) -> Result<Term, ExpressionError> {
        match self {
            Expression::Constant(term) => Ok(term.clone()),
            Expression::Variable(variable) => {
                bindings.get(variable).cloned().ok_or_else(|| {
                    ExpressionError::UnboundVariable(variable.as_str().to_owned())
                })
            }
            Expression::Or(a, b) => {
                let left = boolean_operand(a, bindings, functions);
                let right = boolean_operand(b, bindings, functions);
                match (left, right) {
                    (Ok(true), _) | (_, Ok(true)) => Ok(Literal::from(true).into()),
                    (Ok(false), Ok(false)) => Ok(Literal::from(false).into()),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
            Expression::And(a, b) => {
                let left = boolean_operand(a, bindings, functions);
                let right = boolean_operand(b, bindings, functions);
                match (left, right) {
                    (Ok(false), _) | (_, Ok(false)) => Ok(Literal::from(false).into()),
                    (Ok(true), Ok(true)) => Ok(Literal::from(true).into()),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
            Expression::Not(inner) => {
                let value = boolean_operand(inner, bindings, functions)?;
                Ok(Literal::from(!value).into())
            }
            Expression::Compare(a, comparator, b) => {
                let left = a.evaluate(bindings, functions)?;
                let right = b.evaluate(bindings, functions)?;
                let result = match comparator {
                    Comparator::Eq => equals(&left, &right)?,
                    Comparator::Ne => !equals(&left, &right)?,
                    Comparator::Lt => compare(&left, &right)? == Ordering::Less,
                    Comparator::Le => compare(&left, &right)? != Ordering::Greater,
                    Comparator::Gt => compare(&left, &right)? == Ordering::Greater,
                    Comparator::Ge => compare(&left, &right)? != Ordering::Less,
                };
                Ok(Literal::from(result).into())
            }
            Expression::Add(a, b) => arithmetic(a, b, bindings, functions, NumericOp::Add),
            Expression::Subtract(a, b) => {
                arithmetic(a, b, bindings, functions, NumericOp::Subtract)
            }
            Expression::Multiply(a, b) => {
                arithmetic(a, b, bindings, functions, NumericOp::Multiply)
            }
            Expression::Divide(a, b) => {
                arithmetic(a, b, bindings, functions, NumericOp::Divide)
            }
            Expression::FunctionCall(name, args) => {
                let function = functions
                    .get(name)
                    .ok_or_else(|| ExpressionError::UnknownFunction(name.as_str().to_owned()))?;
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(bindings, functions))
                    .collect::<Result<Vec<_>, _>>()?;
                function(&args)
            }
        }
    }
}

fn boolean_operand(
    operand: &Expression,
    bindings: &BindingSet,
    functions: &FunctionRegistry,
) -> Result<bool, ExpressionError> {
    let term = operand.evaluate(bindings, functions)?;
    effective_boolean_value(&term)
}

fn arithmetic(
    a: &Expression,
    b: &Expression,
    bindings: &BindingSet,
    functions: &FunctionRegistry,
    op: NumericOp,
) -> Result<Term, ExpressionError> {
    let left = numeric_operand(&a.evaluate(bindings, functions)?)?;
    let right = numeric_operand(&b.evaluate(bindings, functions)?)?;
    // Division always promotes, matching SPARQL's non-integer division.
    let result = match (left, right, op) {
        (Numeric::Integer(l), Numeric::Integer(r), NumericOp::Add) => {
            return integer_result(l.checked_add(r));
        }
        (Numeric::Integer(l), Numeric::Integer(r), NumericOp::Subtract) => {
            return integer_result(l.checked_sub(r));
        }
        (Numeric::Integer(l), Numeric::Integer(r), NumericOp::Multiply) => {
            return integer_result(l.checked_mul(r));
        }
        (l, r, op) => {
            let l = l.to_double();
            let r = r.to_double();
            match op {
                NumericOp::Add => l + r,
                NumericOp::Subtract => l - r,
                NumericOp::Multiply => l * r,
                NumericOp::Divide => l / r,
            }
        }
    };
    Ok(Literal::from(f64::from(result)).into())
}

#[derive(Debug, Clone, Copy)]
enum NumericOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// A numeric literal value, promoted along the integer < double axis.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Numeric {
    Integer(Integer),
    Double(Double),
}

impl Numeric {
    pub(crate) fn to_double(self) -> Double {
        match self {
            Numeric::Integer(i) => i.into(),
            Numeric::Double(d) => d,
        }
    }
}

fn integer_result(value: Option<Integer>) -> Result<Term, ExpressionError> {
    let value =
        value.ok_or_else(|| ExpressionError::TypeMismatch("integer overflow".to_owned()))?;
    Ok(Literal::new_typed_literal(value.to_string(), xsd::INTEGER).into())
}

fn numeric_operand(term: &Term) -> Result<Numeric, ExpressionError> {
    if let Term::Literal(lit) = term {
        if let Some(n) = numeric_value(lit) {
            return Ok(n);
        }
    }
    Err(ExpressionError::TypeMismatch(format!(
        "{term} is not a number"
    )))
}

/// The numeric value of a literal, or `None` for non-numeric literals and
/// unparsable lexical forms.
pub(crate) fn numeric_value(literal: &Literal) -> Option<Numeric> {
    let datatype = literal.datatype();
    if datatype == xsd::INTEGER
        || datatype == xsd::LONG
        || datatype == xsd::INT
        || datatype == xsd::SHORT
        || datatype == xsd::BYTE
        || datatype == xsd::NON_NEGATIVE_INTEGER
        || datatype == xsd::POSITIVE_INTEGER
    {
        Integer::from_str(literal.value()).ok().map(Numeric::Integer)
    } else if datatype == xsd::DOUBLE || datatype == xsd::FLOAT || datatype == xsd::DECIMAL {
        Double::from_str(literal.value()).ok().map(Numeric::Double)
    } else {
        None
    }
}

fn string_value(literal: &Literal) -> Option<&str> {
    if literal.language().is_some() || literal.datatype() == xsd::STRING {
        Some(literal.value())
    } else {
        None
    }
}

fn boolean_value(literal: &Literal) -> Option<bool> {
    if literal.datatype() == xsd::BOOLEAN {
        Boolean::from_str(literal.value()).ok().map(bool::from)
    } else {
        None
    }
}

/// The effective boolean value of a term: booleans as themselves, strings by
/// non-emptiness, numbers by non-zero (NaN is false). Anything else, IRIs
/// and blank nodes included, is a type error.
pub fn effective_boolean_value(term: &Term) -> Result<bool, ExpressionError> {
    if let Term::Literal(lit) = term {
        if let Some(b) = boolean_value(lit) {
            return Ok(b);
        }
        if let Some(s) = string_value(lit) {
            return Ok(!s.is_empty());
        }
        if let Some(n) = numeric_value(lit) {
            return Ok(match n {
                Numeric::Integer(i) => i != Integer::from(0),
                Numeric::Double(d) => !d.is_nan() && d != Double::from(0.0),
            });
        }
    }
    Err(ExpressionError::TypeMismatch(format!(
        "{term} has no effective boolean value"
    )))
}

/// Value equality: numeric literals by value with promotion, everything else
/// by term equality. Unequal literals of unknown datatypes are incomparable
/// rather than unequal.
pub fn equals(a: &Term, b: &Term) -> Result<bool, ExpressionError> {
    if a == b {
        return Ok(true);
    }
    if let (Term::Literal(la), Term::Literal(lb)) = (a, b) {
        if let (Some(na), Some(nb)) = (numeric_value(la), numeric_value(lb)) {
            return Ok(match (na, nb) {
                (Numeric::Integer(x), Numeric::Integer(y)) => x == y,
                (x, y) => x.to_double() == y.to_double(),
            });
        }
        let known = |l: &Literal| {
            string_value(l).is_some()
                || boolean_value(l).is_some()
                || numeric_value(l).is_some()
                || l.language().is_some()
        };
        if !known(la) || !known(lb) {
            return Err(ExpressionError::Incomparable);
        }
    }
    Ok(false)
}

/// Value ordering for the inequality comparators: numerics, strings and
/// booleans compare by value, everything else is incomparable.
pub fn compare(a: &Term, b: &Term) -> Result<Ordering, ExpressionError> {
    let (Term::Literal(la), Term::Literal(lb)) = (a, b) else {
        return Err(ExpressionError::Incomparable);
    };
    if let (Some(na), Some(nb)) = (numeric_value(la), numeric_value(lb)) {
        return match (na, nb) {
            (Numeric::Integer(x), Numeric::Integer(y)) => Ok(x.cmp(&y)),
            (x, y) => x
                .to_double()
                .partial_cmp(&y.to_double())
                .ok_or(ExpressionError::Incomparable),
        };
    }
    if let (Some(sa), Some(sb)) = (string_value(la), string_value(lb)) {
        return Ok(sa.cmp(sb));
    }
    if let (Some(ba), Some(bb)) = (boolean_value(la), boolean_value(lb)) {
        return Ok(ba.cmp(&bb));
    }
    Err(ExpressionError::Incomparable)
}

/// The total order used by `Order` nodes: unbound first, then blank nodes,
/// IRIs and literals. Numeric literals sort by value, all other literals by
/// lexical form, so the result is stable even for incomparable values.
pub fn value_cmp(a: Option<&Term>, b: Option<&Term>) -> Ordering {
    fn rank(term: &Term) -> u8 {
        match term {
            Term::BlankNode(_) => 0,
            Term::NamedNode(_) => 1,
            Term::Literal(_) => 2,
        }
    }
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
            (Term::BlankNode(x), Term::BlankNode(y)) => x.as_str().cmp(y.as_str()),
            (Term::NamedNode(x), Term::NamedNode(y)) => x.as_str().cmp(y.as_str()),
            (Term::Literal(x), Term::Literal(y)) => {
                if let (Some(nx), Some(ny)) = (numeric_value(x), numeric_value(y)) {
                    nx.to_double()
                        .partial_cmp(&ny.to_double())
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| x.value().cmp(y.value()))
                } else {
                    x.value()
                        .cmp(y.value())
                        .then_with(|| x.datatype().as_str().cmp(y.datatype().as_str()))
                        .then_with(|| x.language().cmp(&y.language()))
                }
            }
            _ => Ordering::Equal,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Term {
        Literal::from(i).into()
    }

    fn dbl(d: f64) -> Term {
        Literal::from(d).into()
    }

    fn eval(expr: &Expression) -> Result<Term, ExpressionError> {
        expr.evaluate(&BindingSet::new(), &FunctionRegistry::new())
    }

    #[test]
    fn test_numeric_promotion() {
        assert!(equals(&int(2), &dbl(2.0)).unwrap());
        assert_eq!(compare(&int(2), &dbl(2.5)).unwrap(), Ordering::Less);

        let sum = eval(&Expression::Add(
            Box::new(Expression::constant(Literal::from(2_i64))),
            Box::new(Expression::constant(Literal::from(3_i64))),
        ))
        .unwrap();
        assert!(equals(&sum, &int(5)).unwrap());
    }

    #[test]
    fn test_division_promotes_to_double() {
        let quotient = eval(&Expression::Divide(
            Box::new(Expression::constant(Literal::from(7_i64))),
            Box::new(Expression::constant(Literal::from(2_i64))),
        ))
        .unwrap();
        assert!(equals(&quotient, &dbl(3.5)).unwrap());
    }

    #[test]
    fn test_three_valued_logic() {
        let t = Expression::constant(Literal::from(true));
        let f = Expression::constant(Literal::from(false));
        // Errors on one side do not hide a deciding value on the other.
        let broken = Expression::Variable(Variable::new_unchecked("unbound"));

        let or = Expression::Or(Box::new(broken.clone()), Box::new(t.clone()));
        assert_eq!(eval(&or).unwrap(), Literal::from(true).into());

        let and = Expression::And(Box::new(broken.clone()), Box::new(f));
        assert_eq!(eval(&and).unwrap(), Literal::from(false).into());

        let and_true = Expression::And(Box::new(broken), Box::new(t));
        assert!(eval(&and_true).is_err());
    }

    #[test]
    fn test_ebv() {
        assert!(effective_boolean_value(&Literal::from(true).into()).unwrap());
        assert!(!effective_boolean_value(&Literal::new_simple_literal("").into()).unwrap());
        assert!(effective_boolean_value(&Literal::new_simple_literal("x").into()).unwrap());
        assert!(!effective_boolean_value(&int(0)).unwrap());
        assert!(effective_boolean_value(&dbl(0.5)).unwrap());
        assert!(effective_boolean_value(
            &Term::from(NamedNode::new_unchecked("http://example.com/"))
        )
        .is_err());
    }

    #[test]
    fn test_value_order() {
        let bnode: Term = quadmem_model::BlankNode::new_unchecked("b").into();
        let iri: Term = NamedNode::new_unchecked("http://example.com/a").into();
        assert_eq!(value_cmp(None, Some(&bnode)), Ordering::Less);
        assert_eq!(value_cmp(Some(&bnode), Some(&iri)), Ordering::Less);
        assert_eq!(value_cmp(Some(&iri), Some(&int(1))), Ordering::Less);
        assert_eq!(value_cmp(Some(&int(2)), Some(&dbl(10.0))), Ordering::Less);
    }
}
