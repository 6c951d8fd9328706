//! The extensible function registry backing [`Expression::FunctionCall`].
//!
//! Functions are keyed by IRI. The registry starts out with the string,
//! numeric and hash builtins under `http://www.w3.org/ns/sparql#`; callers
//! register their own extension functions next to them.
//!
//! [`Expression::FunctionCall`]: crate::expression::Expression::FunctionCall

use crate::error::ExpressionError;
use crate::expression::{numeric_value, Numeric};
use md5::{Digest, Md5};
use quadmem_model::vocab::xsd;
use quadmem_model::{Literal, NamedNode, NamedNodeRef, Term};
use regex::RegexBuilder;
use rustc_hash::FxHashMap;
use sha1::Sha1;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

pub type Function = dyn Fn(&[Term]) -> Result<Term, ExpressionError> + Send + Sync;

/// IRIs of the built-in functions.
pub mod builtin {
    use quadmem_model::NamedNodeRef;

    pub const STR: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#str");
    pub const STRLEN: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#strlen");
    pub const UCASE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#ucase");
    pub const LCASE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#lcase");
    pub const CONCAT: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#concat");
    pub const CONTAINS: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#contains");
    pub const REGEX: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#regex");
    pub const ABS: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#abs");
    pub const ROUND: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#round");
    pub const MD5: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#md5");
    pub const SHA1: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#sha1");
    pub const SHA256: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql#sha256");
}

/// Maps function IRIs to implementations.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: FxHashMap<NamedNode, Arc<Function>>,
}

impl FunctionRegistry {
    /// A registry with all builtins pre-registered.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(builtin::STR.into_owned(), fn_str);
        registry.register(builtin::STRLEN.into_owned(), fn_strlen);
        registry.register(builtin::UCASE.into_owned(), fn_ucase);
        registry.register(builtin::LCASE.into_owned(), fn_lcase);
        registry.register(builtin::CONCAT.into_owned(), fn_concat);
        registry.register(builtin::CONTAINS.into_owned(), fn_contains);
        registry.register(builtin::REGEX.into_owned(), fn_regex);
        registry.register(builtin::ABS.into_owned(), fn_abs);
        registry.register(builtin::ROUND.into_owned(), fn_round);
        registry.register(builtin::MD5.into_owned(), hash_fn::<Md5>);
        registry.register(builtin::SHA1.into_owned(), hash_fn::<Sha1>);
        registry.register(builtin::SHA256.into_owned(), hash_fn::<Sha256>);
        registry
    }

    /// A registry without any functions, builtins included.
    pub fn empty() -> Self {
        Self {
            functions: FxHashMap::default(),
        }
    }

    /// Registers `function` under `name`, replacing any previous registration
    /// for that IRI.
    pub fn register(
        &mut self,
        name: NamedNode,
        function: impl Fn(&[Term]) -> Result<Term, ExpressionError> + Send + Sync + 'static,
    ) {
        self.functions.insert(name, Arc::new(function));
    }

    pub fn get(&self, name: &NamedNode) -> Option<&Function> {
        self.functions.get(name).map(AsRef::as_ref)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys())
            .finish()
    }
}

fn check_arity(
    name: NamedNodeRef<'_>,
    expected: usize,
    args: &[Term],
) -> Result<(), ExpressionError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ExpressionError::Arity {
            iri: name.as_str().to_owned(),
            expected,
            actual: args.len(),
        })
    }
}

/// The string argument of a string function: a simple, `xsd:string` or
/// language-tagged literal.
fn string_arg(term: &Term) -> Result<&Literal, ExpressionError> {
    if let Term::Literal(lit) = term {
        if lit.language().is_some() || lit.datatype() == xsd::STRING {
            return Ok(lit);
        }
    }
    Err(ExpressionError::TypeMismatch(format!(
        "{term} is not a string literal"
    )))
}

fn numeric_arg(term: &Term) -> Result<Numeric, ExpressionError> {
    if let Term::Literal(lit) = term {
        if let Some(n) = numeric_value(lit) {
            return Ok(n);
        }
    }
    Err(ExpressionError::TypeMismatch(format!(
        "{term} is not a number"
    )))
}

/// Rebuilds a string result with the language tag of its input, so case
/// mapping does not strip tags.
fn string_like(value: String, input: &Literal) -> Term {
    match input.language() {
        Some(lang) => Literal::new_language_tagged_literal_unchecked(value, lang).into(),
        None => Literal::new_simple_literal(value).into(),
    }
}

fn fn_str(args: &[Term]) -> Result<Term, ExpressionError> {
    check_arity(builtin::STR, 1, args)?;
    match &args[0] {
        Term::NamedNode(n) => Ok(Literal::new_simple_literal(n.as_str()).into()),
        Term::Literal(l) => Ok(Literal::new_simple_literal(l.value()).into()),
        Term::BlankNode(b) => Err(ExpressionError::TypeMismatch(format!(
            "{b} has no string form"
        ))),
    }
}

fn fn_strlen(args: &[Term]) -> Result<Term, ExpressionError> {
    check_arity(builtin::STRLEN, 1, args)?;
    let value = string_arg(&args[0])?.value();
    let length = i64::try_from(value.chars().count())
        .map_err(|_| ExpressionError::TypeMismatch("string length overflow".to_owned()))?;
    Ok(Literal::from(length).into())
}

fn fn_ucase(args: &[Term]) -> Result<Term, ExpressionError> {
    check_arity(builtin::UCASE, 1, args)?;
    let input = string_arg(&args[0])?;
    Ok(string_like(input.value().to_uppercase(), input))
}

fn fn_lcase(args: &[Term]) -> Result<Term, ExpressionError> {
    check_arity(builtin::LCASE, 1, args)?;
    let input = string_arg(&args[0])?;
    Ok(string_like(input.value().to_lowercase(), input))
}

fn fn_concat(args: &[Term]) -> Result<Term, ExpressionError> {
    let mut result = String::new();
    for arg in args {
        result.push_str(string_arg(arg)?.value());
    }
    Ok(Literal::new_simple_literal(result).into())
}

fn fn_contains(args: &[Term]) -> Result<Term, ExpressionError> {
    check_arity(builtin::CONTAINS, 2, args)?;
    let haystack = string_arg(&args[0])?.value();
    let needle = string_arg(&args[1])?.value();
    Ok(Literal::from(haystack.contains(needle)).into())
}

fn fn_regex(args: &[Term]) -> Result<Term, ExpressionError> {
    if args.len() != 2 && args.len() != 3 {
        return Err(ExpressionError::Arity {
            iri: builtin::REGEX.as_str().to_owned(),
            expected: 2,
            actual: args.len(),
        });
    }
    let text = string_arg(&args[0])?.value();
    let pattern = string_arg(&args[1])?.value();
    let mut builder = RegexBuilder::new(pattern);
    if let Some(flags) = args.get(2) {
        for flag in string_arg(flags)?.value().chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                's' => builder.dot_matches_new_line(true),
                'm' => builder.multi_line(true),
                'x' => builder.ignore_whitespace(true),
                _ => {
                    return Err(ExpressionError::InvalidRegex(format!(
                        "unsupported flag '{flag}'"
                    )))
                }
            };
        }
    }
    let regex = builder
        .build()
        .map_err(|e| ExpressionError::InvalidRegex(e.to_string()))?;
    Ok(Literal::from(regex.is_match(text)).into())
}

fn fn_abs(args: &[Term]) -> Result<Term, ExpressionError> {
    check_arity(builtin::ABS, 1, args)?;
    match numeric_arg(&args[0])? {
        Numeric::Integer(i) => {
            let abs = i
                .checked_abs()
                .ok_or_else(|| ExpressionError::TypeMismatch("integer overflow".to_owned()))?;
            Ok(Literal::new_typed_literal(abs.to_string(), xsd::INTEGER).into())
        }
        Numeric::Double(d) => Ok(Literal::from(f64::from(d.abs())).into()),
    }
}

fn fn_round(args: &[Term]) -> Result<Term, ExpressionError> {
    check_arity(builtin::ROUND, 1, args)?;
    match numeric_arg(&args[0])? {
        Numeric::Integer(i) => Ok(Literal::new_typed_literal(i.to_string(), xsd::INTEGER).into()),
        Numeric::Double(d) => Ok(Literal::from(f64::from(d.round())).into()),
    }
}

fn hash_fn<D: Digest>(args: &[Term]) -> Result<Term, ExpressionError> {
    if args.len() != 1 {
        return Err(ExpressionError::TypeMismatch(format!(
            "hash functions take one argument, got {}",
            args.len()
        )));
    }
    let input = string_arg(&args[0])?.value();
    let digest = D::digest(input.as_bytes());
    Ok(Literal::new_simple_literal(hex::encode(digest)).into())
}
