use crate::error::QueryEvaluationError;
use itertools::Itertools;
use quadmem_model::{Term, Variable};
use std::fmt;

/// A solution: a set of variable → term bindings.
///
/// Bindings are kept sorted by variable name, so two sets binding the same
/// variables to the same terms are equal and hash alike regardless of the
/// order the bindings were added in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingSet {
    bindings: Vec<(Variable, Term)>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, variable: &Variable) -> Option<&Term> {
        self.position(variable).ok().map(|i| &self.bindings[i].1)
    }

    pub fn contains(&self, variable: &Variable) -> bool {
        self.position(variable).is_ok()
    }

    /// Binds `variable` to `value`, replacing any existing binding.
    pub fn bind(&mut self, variable: Variable, value: Term) {
        match self.position(&variable) {
            Ok(i) => self.bindings[i].1 = value,
            Err(i) => self.bindings.insert(i, (variable, value)),
        }
    }

    /// Builder-style [`bind`](Self::bind).
    pub fn with(mut self, variable: Variable, value: Term) -> Self {
        self.bind(variable, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Term)> {
        self.bindings.iter().map(|(v, t)| (v, t))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.bindings.iter().map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Merges two solutions into one, or `None` if they disagree on a shared
    /// variable.
    pub fn merge_compatible(&self, other: &BindingSet) -> Option<BindingSet> {
        let mut result = self.clone();
        for (variable, value) in other.iter() {
            match result.get(variable) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => result.bind(variable.clone(), value.clone()),
            }
        }
        Some(result)
    }

    fn position(&self, variable: &Variable) -> Result<usize, usize> {
        self.bindings
            .binary_search_by(|(v, _)| v.as_str().cmp(variable.as_str()))
    }
}

impl fmt::Display for BindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}}}",
            self.bindings
                .iter()
                .map(|(v, t)| format!("{v}={t}"))
                .format(", ")
        )
    }
}

impl FromIterator<(Variable, Term)> for BindingSet {
    fn from_iter<I: IntoIterator<Item = (Variable, Term)>>(iter: I) -> Self {
        let mut result = Self::new();
        for (variable, value) in iter {
            result.bind(variable, value);
        }
        result
    }
}

/// A push-style sink for query solutions, the seam towards tuple-result
/// writers (CSV, TSV, XML and friends live outside this crate).
pub trait QueryResultsHandler {
    fn start_results(&mut self, _variables: &[Variable]) -> Result<(), QueryEvaluationError> {
        Ok(())
    }

    fn handle_solution(&mut self, solution: &BindingSet) -> Result<(), QueryEvaluationError>;

    fn end_results(&mut self) -> Result<(), QueryEvaluationError> {
        Ok(())
    }
}

/// Pushes every solution of an evaluation into `handler`, surfacing the
/// first evaluation or handler error. Returns the number of solutions
/// handled.
pub fn drain_results(
    variables: &[Variable],
    results: impl Iterator<Item = Result<BindingSet, QueryEvaluationError>>,
    handler: &mut dyn QueryResultsHandler,
) -> Result<usize, QueryEvaluationError> {
    handler.start_results(variables)?;
    let mut count = 0;
    for solution in results {
        handler.handle_solution(&solution?)?;
        count += 1;
    }
    handler.end_results()?;
    Ok(count)
}
