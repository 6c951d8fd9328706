//! The iterator-based evaluator.
//!
//! [`EvaluationStrategy::evaluate`] turns a [`TupleExpr`] into a lazy stream
//! of solutions. Streaming operators (patterns, joins against patterns,
//! unions, filters) never buffer; materializing operators (hash joins,
//! distinct, order, set operations, path closures) account every buffered
//! solution against an optional evaluation budget and fail the query with
//! [`QueryEvaluationError::SizeLimitExceeded`] once it is spent.

use crate::algebra::{StatementPattern, TermPattern, TupleExpr};
use crate::binding::BindingSet;
use crate::error::QueryEvaluationError;
use crate::expression::{effective_boolean_value, value_cmp};
use crate::functions::FunctionRegistry;
use quadmem_common::QuadPatternSource;
use quadmem_model::{GraphName, GraphNameRef, Quad, Subject, SubjectRef, Term, Variable};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// A lazy stream of solutions.
pub type BindingIter = Box<dyn Iterator<Item = Result<BindingSet, QueryEvaluationError>>>;

/// A shared cap on the number of solutions one evaluation may buffer,
/// summed across all materializing operators of the plan.
#[derive(Debug)]
pub struct EvaluationBudget {
    used: AtomicUsize,
    max_size: usize,
}

impl EvaluationBudget {
    pub fn new(max_size: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            max_size,
        }
    }

    pub fn claim(&self, amount: usize) -> Result<(), QueryEvaluationError> {
        let used = self.used.fetch_add(amount, AtomicOrdering::Relaxed) + amount;
        if used > self.max_size {
            tracing::debug!(used, max_size = self.max_size, "evaluation budget spent");
            Err(QueryEvaluationError::SizeLimitExceeded {
                max_size: self.max_size,
            })
        } else {
            Ok(())
        }
    }
}

/// Evaluates query plans against a [`QuadPatternSource`].
#[derive(Clone)]
pub struct EvaluationStrategy {
    source: Arc<dyn QuadPatternSource>,
    functions: Arc<FunctionRegistry>,
    budget: Option<Arc<EvaluationBudget>>,
}

impl EvaluationStrategy {
    /// A strategy over `source` with the builtin functions and no budget.
    pub fn new(source: Arc<dyn QuadPatternSource>) -> Self {
        Self {
            source,
            functions: Arc::new(FunctionRegistry::new()),
            budget: None,
        }
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    /// Caps the number of solutions materializing operators may buffer.
    pub fn with_size_limit(mut self, max_size: usize) -> Self {
        self.budget = Some(Arc::new(EvaluationBudget::new(max_size)));
        self
    }

    fn claim(&self, amount: usize) -> Result<(), QueryEvaluationError> {
        match &self.budget {
            Some(budget) => budget.claim(amount),
            None => Ok(()),
        }
    }

    /// Evaluates `expr` with the bindings of `input` already fixed.
    pub fn evaluate(&self, expr: &TupleExpr, input: BindingSet) -> BindingIter {
        match expr {
            TupleExpr::Pattern(pattern) => self.evaluate_pattern(pattern, input),
            TupleExpr::Join(l, r) => self.evaluate_join(l, r, input),
            TupleExpr::Union(l, r) => {
                Box::new(self.evaluate(l, input.clone()).chain(self.evaluate(r, input)))
            }
            TupleExpr::Difference(l, r) => {
                let right = match self.collect_set(r, input.clone()) {
                    Ok(set) => set,
                    Err(e) => return once_err(e),
                };
                Box::new(self.evaluate(l, input).filter(move |row| match row {
                    Ok(row) => !right.contains(row),
                    Err(_) => true,
                }))
            }
            TupleExpr::Intersection(l, r) => {
                let right = match self.collect_set(r, input.clone()) {
                    Ok(set) => set,
                    Err(e) => return once_err(e),
                };
                Box::new(self.evaluate(l, input).filter(move |row| match row {
                    Ok(row) => right.contains(row),
                    Err(_) => true,
                }))
            }
            TupleExpr::Distinct(inner) => {
                let mut inner = self.evaluate(inner, input);
                let mut seen = FxHashSet::default();
                let budget = self.budget.clone();
                let mut failed = false;
                Box::new(std::iter::from_fn(move || {
                    if failed {
                        return None;
                    }
                    loop {
                        match inner.next()? {
                            Ok(row) => {
                                if seen.contains(&row) {
                                    continue;
                                }
                                if let Some(budget) = &budget {
                                    if let Err(e) = budget.claim(1) {
                                        failed = true;
                                        return Some(Err(e));
                                    }
                                }
                                seen.insert(row.clone());
                                return Some(Ok(row));
                            }
                            Err(e) => return Some(Err(e)),
                        }
                    }
                }))
            }
            TupleExpr::Order(inner, elems) => {
                let mut rows: Vec<BindingSet> = Vec::new();
                for row in self.evaluate(inner, input) {
                    let row = match row {
                        Ok(row) => row,
                        Err(e) => return once_err(e),
                    };
                    // Claimed per row, so an over-budget input stops being
                    // drained at the limit instead of after buffering it all.
                    if let Err(e) = self.claim(1) {
                        return once_err(e);
                    }
                    rows.push(row);
                }
                let mut keyed: Vec<(Vec<Option<Term>>, BindingSet)> = rows
                    .into_iter()
                    .map(|row| {
                        let keys = elems
                            .iter()
                            .map(|elem| elem.expression.evaluate(&row, &self.functions).ok())
                            .collect();
                        (keys, row)
                    })
                    .collect();
                keyed.sort_by(|(ka, _), (kb, _)| {
                    for (elem, (a, b)) in elems.iter().zip(ka.iter().zip(kb)) {
                        let mut ord = value_cmp(a.as_ref(), b.as_ref());
                        if elem.descending {
                            ord = ord.reverse();
                        }
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                Box::new(keyed.into_iter().map(|(_, row)| Ok(row)))
            }
            TupleExpr::Filter(inner, condition) => {
                let functions = Arc::clone(&self.functions);
                let condition = condition.clone();
                Box::new(self.evaluate(inner, input).filter(move |row| match row {
                    Ok(row) => condition
                        .evaluate(row, &functions)
                        .and_then(|value| effective_boolean_value(&value))
                        .unwrap_or(false),
                    Err(_) => true,
                }))
            }
            TupleExpr::Extend(inner, variable, expression) => {
                let functions = Arc::clone(&self.functions);
                let variable = variable.clone();
                let expression = expression.clone();
                Box::new(self.evaluate(inner, input).map(move |row| {
                    let mut row = row?;
                    // An expression error leaves the target unbound.
                    if let Ok(value) = expression.evaluate(&row, &functions) {
                        row.bind(variable.clone(), value);
                    }
                    Ok(row)
                }))
            }
            TupleExpr::ArbitraryLengthPath {
                subject,
                path,
                start,
                end,
                object,
                min_length,
            } => match self.evaluate_path(&input, subject, path, start, end, object, *min_length) {
                Ok(rows) => Box::new(rows.into_iter().map(Ok)),
                Err(e) => once_err(e),
            },
            TupleExpr::SingletonSet => Box::new(std::iter::once(Ok(input))),
            TupleExpr::EmptySet => empty_results(),
        }
    }

    fn evaluate_pattern(&self, pattern: &StatementPattern, input: BindingSet) -> BindingIter {
        let subject = Slot::new(&pattern.subject, &input);
        let predicate = Slot::new(&pattern.predicate, &input);
        let object = Slot::new(&pattern.object, &input);
        let context = pattern.context.as_ref().map(|c| Slot::new(c, &input));

        let subject_ref = match &subject {
            Slot::Bound(Term::NamedNode(n)) => Some(SubjectRef::from(n.as_ref())),
            Slot::Bound(Term::BlankNode(b)) => Some(SubjectRef::from(b.as_ref())),
            Slot::Bound(Term::Literal(_)) => return empty_results(),
            Slot::Var(_) => None,
        };
        let predicate_ref = match &predicate {
            Slot::Bound(Term::NamedNode(n)) => Some(n.as_ref()),
            Slot::Bound(_) => return empty_results(),
            Slot::Var(_) => None,
        };
        let object_ref = match &object {
            Slot::Bound(t) => Some(t.as_ref()),
            Slot::Var(_) => None,
        };
        let context_list;
        let contexts_ref: Option<&[GraphNameRef<'_>]> = match &context {
            Some(Slot::Bound(Term::NamedNode(n))) => {
                context_list = [GraphNameRef::NamedNode(n.as_ref())];
                Some(&context_list)
            }
            Some(Slot::Bound(Term::BlankNode(b))) => {
                context_list = [GraphNameRef::BlankNode(b.as_ref())];
                Some(&context_list)
            }
            Some(Slot::Bound(Term::Literal(_))) => return empty_results(),
            // A context variable matches any named context, bound per quad.
            Some(Slot::Var(_)) | None => None,
        };

        let quads = self
            .source
            .quads_for_pattern(subject_ref, predicate_ref, object_ref, contexts_ref);

        Box::new(quads.filter_map(move |quad| {
            let Quad {
                subject: quad_subject,
                predicate: quad_predicate,
                object: quad_object,
                graph_name,
            } = quad;
            let mut result = input.clone();
            if let Slot::Var(v) = &subject {
                let term = match quad_subject {
                    Subject::NamedNode(n) => Term::from(n),
                    Subject::BlankNode(b) => Term::from(b),
                };
                if !bind_checked(&mut result, v, term) {
                    return None;
                }
            }
            if let Slot::Var(v) = &predicate {
                if !bind_checked(&mut result, v, Term::from(quad_predicate)) {
                    return None;
                }
            }
            if let Slot::Var(v) = &object {
                if !bind_checked(&mut result, v, quad_object) {
                    return None;
                }
            }
            if let Some(Slot::Var(v)) = &context {
                let term = match graph_name {
                    GraphName::NamedNode(n) => Term::from(n),
                    GraphName::BlankNode(b) => Term::from(b),
                    GraphName::DefaultGraph => return None,
                };
                if !bind_checked(&mut result, v, term) {
                    return None;
                }
            }
            Some(Ok(result))
        }))
    }

    /// Joins lazily against pattern-shaped right-hand sides, where feeding
    /// the left bindings into the scan prunes it; everything else is
    /// hash-joined on the shared variables.
    fn evaluate_join(&self, l: &TupleExpr, r: &TupleExpr, input: BindingSet) -> BindingIter {
        if matches!(r, TupleExpr::Pattern(_) | TupleExpr::ArbitraryLengthPath { .. }) {
            let strategy = self.clone();
            let right = r.clone();
            return Box::new(self.evaluate(l, input).flat_map(move |row| match row {
                Ok(row) => strategy.evaluate(&right, row),
                Err(e) => once_err(e),
            }));
        }

        let left_vars = l.variables();
        let shared: Vec<Variable> = r
            .variables()
            .into_iter()
            .filter(|v| left_vars.contains(v))
            .collect();
        let table = match self.build_join_table(r, input.clone(), shared) {
            Ok(table) => table,
            Err(e) => return once_err(e),
        };
        Box::new(self.evaluate(l, input).flat_map(move |row| -> Vec<_> {
            match row {
                Ok(row) => table.probe(&row).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            }
        }))
    }

    fn build_join_table(
        &self,
        expr: &TupleExpr,
        input: BindingSet,
        shared: Vec<Variable>,
    ) -> Result<JoinTable, QueryEvaluationError> {
        let mut table = JoinTable {
            shared,
            rows: Vec::new(),
            keyed: FxHashMap::default(),
            loose: Vec::new(),
        };
        for row in self.evaluate(expr, input) {
            self.claim(1)?;
            table.insert(row?);
        }
        Ok(table)
    }

    fn collect_set(
        &self,
        expr: &TupleExpr,
        input: BindingSet,
    ) -> Result<FxHashSet<BindingSet>, QueryEvaluationError> {
        let mut set = FxHashSet::default();
        for row in self.evaluate(expr, input) {
            if set.insert(row?) {
                self.claim(1)?;
            }
        }
        Ok(set)
    }

    /// One step of a path: evaluates the step expression with the given
    /// endpoint bindings and collects the `(start, end)` pairs it produces.
    fn step(
        &self,
        path: &TupleExpr,
        start: &Variable,
        end: &Variable,
        origin: Option<&Term>,
        target: Option<&Term>,
    ) -> Result<Vec<(Term, Term)>, QueryEvaluationError> {
        let mut seed = BindingSet::new();
        if let Some(origin) = origin {
            seed.bind(start.clone(), origin.clone());
        }
        if let Some(target) = target {
            seed.bind(end.clone(), target.clone());
        }
        let mut pairs = Vec::new();
        for row in self.evaluate(path, seed) {
            let row = row?;
            if let (Some(s), Some(e)) = (row.get(start), row.get(end)) {
                self.claim(1)?;
                pairs.push((s.clone(), e.clone()));
            }
        }
        Ok(pairs)
    }

    fn step_from(
        &self,
        path: &TupleExpr,
        start: &Variable,
        end: &Variable,
        node: &Term,
        forward: bool,
    ) -> Result<Vec<Term>, QueryEvaluationError> {
        let pairs = if forward {
            self.step(path, start, end, Some(node), None)?
        } else {
            self.step(path, start, end, None, Some(node))?
        };
        Ok(pairs
            .into_iter()
            .map(|(s, e)| if forward { e } else { s })
            .collect())
    }

    /// Every node reachable from `seeds` by one or more steps.
    fn close(
        &self,
        path: &TupleExpr,
        start: &Variable,
        end: &Variable,
        seeds: Vec<Term>,
        forward: bool,
    ) -> Result<Vec<Term>, QueryEvaluationError> {
        let mut reached = Vec::new();
        let mut seen: FxHashSet<Term> = FxHashSet::default();
        let mut expanded: FxHashSet<Term> = seeds.iter().cloned().collect();
        let mut queue = seeds;
        while let Some(node) = queue.pop() {
            for target in self.step_from(path, start, end, &node, forward)? {
                if seen.insert(target.clone()) {
                    self.claim(1)?;
                    reached.push(target.clone());
                }
                if expanded.insert(target.clone()) {
                    queue.push(target);
                }
            }
        }
        Ok(reached)
    }

    /// The set of nodes at the end of a walk of exactly `depth` steps.
    fn walk_frontier(
        &self,
        path: &TupleExpr,
        start: &Variable,
        end: &Variable,
        origin: &Term,
        depth: u32,
        forward: bool,
    ) -> Result<Vec<Term>, QueryEvaluationError> {
        let mut current: FxHashSet<Term> = std::iter::once(origin.clone()).collect();
        for _ in 0..depth {
            let mut next = FxHashSet::default();
            for node in &current {
                next.extend(self.step_from(path, start, end, node, forward)?);
            }
            if next.is_empty() {
                return Ok(Vec::new());
            }
            self.claim(next.len())?;
            current = next;
        }
        Ok(current.into_iter().collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_path(
        &self,
        input: &BindingSet,
        subject: &TermPattern,
        path: &TupleExpr,
        start: &Variable,
        end: &Variable,
        object: &TermPattern,
        min_length: u32,
    ) -> Result<Vec<BindingSet>, QueryEvaluationError> {
        let subject_term = resolved_term(subject, input);
        let object_term = resolved_term(object, input);
        match (subject_term, object_term) {
            (Some(s), Some(o)) => {
                if min_length == 0 && s == o {
                    return Ok(vec![input.clone()]);
                }
                let seeds = if min_length > 1 {
                    self.walk_frontier(path, start, end, &s, min_length - 1, true)?
                } else {
                    vec![s]
                };
                let reached = self.close(path, start, end, seeds, true)?;
                Ok(if reached.contains(&o) {
                    vec![input.clone()]
                } else {
                    Vec::new()
                })
            }
            (Some(s), None) => {
                let TermPattern::Variable(object_var) = object else {
                    return Ok(Vec::new());
                };
                let seeds = if min_length > 1 {
                    self.walk_frontier(path, start, end, &s, min_length - 1, true)?
                } else {
                    vec![s.clone()]
                };
                let mut reached = self.close(path, start, end, seeds, true)?;
                if min_length == 0 && !reached.contains(&s) {
                    reached.push(s);
                }
                Ok(reached
                    .into_iter()
                    .filter_map(|t| {
                        let mut row = input.clone();
                        bind_checked(&mut row, object_var, t).then_some(row)
                    })
                    .collect())
            }
            (None, Some(o)) => {
                let TermPattern::Variable(subject_var) = subject else {
                    return Ok(Vec::new());
                };
                let seeds = if min_length > 1 {
                    self.walk_frontier(path, start, end, &o, min_length - 1, false)?
                } else {
                    vec![o.clone()]
                };
                let mut reached = self.close(path, start, end, seeds, false)?;
                if min_length == 0 && !reached.contains(&o) {
                    reached.push(o);
                }
                Ok(reached
                    .into_iter()
                    .filter_map(|t| {
                        let mut row = input.clone();
                        bind_checked(&mut row, subject_var, t).then_some(row)
                    })
                    .collect())
            }
            (None, None) => {
                let (TermPattern::Variable(subject_var), TermPattern::Variable(object_var)) =
                    (subject, object)
                else {
                    return Ok(Vec::new());
                };
                let pairs = self.step(path, start, end, None, None)?;
                let mut adjacency: FxHashMap<Term, Vec<Term>> = FxHashMap::default();
                let mut nodes: FxHashSet<Term> = FxHashSet::default();
                for (s, e) in pairs {
                    nodes.insert(s.clone());
                    nodes.insert(e.clone());
                    adjacency.entry(s).or_default().push(e);
                }
                let mut results = Vec::new();
                if min_length == 0 {
                    for node in &nodes {
                        emit_pair(input, subject_var, object_var, node, node, &mut results);
                    }
                    self.claim(results.len())?;
                }
                for s_node in adjacency.keys() {
                    let seeds = if min_length > 1 {
                        adjacency_frontier(&adjacency, s_node, min_length - 1)
                    } else {
                        vec![s_node.clone()]
                    };
                    let reached = adjacency_close(&adjacency, seeds);
                    self.claim(reached.len())?;
                    for t in &reached {
                        if min_length == 0 && t == s_node {
                            continue;
                        }
                        emit_pair(input, subject_var, object_var, s_node, t, &mut results);
                    }
                }
                Ok(results)
            }
        }
    }
}

impl fmt::Debug for EvaluationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationStrategy")
            .field("functions", &self.functions)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

/// A pattern position after substituting the input bindings.
#[derive(Clone)]
enum Slot {
    Bound(Term),
    Var(Variable),
}

impl Slot {
    fn new(pattern: &TermPattern, input: &BindingSet) -> Self {
        match pattern {
            TermPattern::Term(t) => Slot::Bound(t.clone()),
            TermPattern::Variable(v) => match input.get(v) {
                Some(t) => Slot::Bound(t.clone()),
                None => Slot::Var(v.clone()),
            },
        }
    }
}

/// Materialized right-hand side of a hash join, indexed by the values of the
/// shared variables. Rows not binding every shared variable are probed
/// linearly.
struct JoinTable {
    shared: Vec<Variable>,
    rows: Vec<BindingSet>,
    keyed: FxHashMap<Vec<Term>, Vec<usize>>,
    loose: Vec<usize>,
}

impl JoinTable {
    fn key(&self, row: &BindingSet) -> Option<Vec<Term>> {
        self.shared.iter().map(|v| row.get(v).cloned()).collect()
    }

    fn insert(&mut self, row: BindingSet) {
        let index = self.rows.len();
        match self.key(&row) {
            Some(key) => self.keyed.entry(key).or_default().push(index),
            None => self.loose.push(index),
        }
        self.rows.push(row);
    }

    fn probe(&self, left: &BindingSet) -> Vec<BindingSet> {
        let candidates: Vec<usize> = match self.key(left) {
            Some(key) => self
                .keyed
                .get(&key)
                .into_iter()
                .flatten()
                .chain(&self.loose)
                .copied()
                .collect(),
            None => (0..self.rows.len()).collect(),
        };
        candidates
            .into_iter()
            .filter_map(|i| left.merge_compatible(&self.rows[i]))
            .collect()
    }
}

/// The fixed value of a path endpoint: the pattern constant, or the input
/// binding when the endpoint is an already-bound variable.
fn resolved_term(pattern: &TermPattern, input: &BindingSet) -> Option<Term> {
    match pattern {
        TermPattern::Term(t) => Some(t.clone()),
        TermPattern::Variable(v) => input.get(v).cloned(),
    }
}

fn bind_checked(bindings: &mut BindingSet, variable: &Variable, value: Term) -> bool {
    match bindings.get(variable) {
        Some(existing) => *existing == value,
        None => {
            bindings.bind(variable.clone(), value);
            true
        }
    }
}

fn emit_pair(
    input: &BindingSet,
    subject_var: &Variable,
    object_var: &Variable,
    subject: &Term,
    object: &Term,
    results: &mut Vec<BindingSet>,
) {
    let mut row = input.clone();
    if bind_checked(&mut row, subject_var, subject.clone())
        && bind_checked(&mut row, object_var, object.clone())
    {
        results.push(row);
    }
}

fn adjacency_frontier(
    adjacency: &FxHashMap<Term, Vec<Term>>,
    origin: &Term,
    depth: u32,
) -> Vec<Term> {
    let mut current: FxHashSet<Term> = std::iter::once(origin.clone()).collect();
    for _ in 0..depth {
        let mut next = FxHashSet::default();
        for node in &current {
            if let Some(targets) = adjacency.get(node) {
                next.extend(targets.iter().cloned());
            }
        }
        if next.is_empty() {
            return Vec::new();
        }
        current = next;
    }
    current.into_iter().collect()
}

fn adjacency_close(adjacency: &FxHashMap<Term, Vec<Term>>, seeds: Vec<Term>) -> Vec<Term> {
    let mut reached = Vec::new();
    let mut seen: FxHashSet<Term> = FxHashSet::default();
    let mut expanded: FxHashSet<Term> = seeds.iter().cloned().collect();
    let mut queue = seeds;
    while let Some(node) = queue.pop() {
        if let Some(targets) = adjacency.get(&node) {
            for target in targets {
                if seen.insert(target.clone()) {
                    reached.push(target.clone());
                }
                if expanded.insert(target.clone()) {
                    queue.push(target.clone());
                }
            }
        }
    }
    reached
}

fn empty_results() -> BindingIter {
    Box::new(std::iter::empty())
}

fn once_err(e: QueryEvaluationError) -> BindingIter {
    Box::new(std::iter::once(Err(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::OrderElem;
    use crate::expression::{Comparator, Expression};
    use crate::functions::builtin;
    use quadmem_model::{Literal, NamedNode, NamedNodeRef, TermRef};

    struct VecSource {
        quads: Vec<Quad>,
    }

    impl QuadPatternSource for VecSource {
        fn quads_for_pattern(
            &self,
            subject: Option<SubjectRef<'_>>,
            predicate: Option<NamedNodeRef<'_>>,
            object: Option<TermRef<'_>>,
            contexts: Option<&[GraphNameRef<'_>]>,
        ) -> Box<dyn Iterator<Item = Quad> + Send> {
            let matches: Vec<Quad> = self
                .quads
                .iter()
                .filter(|q| {
                    subject.map_or(true, |s| q.subject.as_ref() == s)
                        && predicate.map_or(true, |p| q.predicate.as_ref() == p)
                        && object.map_or(true, |o| q.object.as_ref() == o)
                        && contexts.map_or(true, |cs| {
                            cs.iter().any(|c| q.graph_name.as_ref() == *c)
                        })
                })
                .cloned()
                .collect();
            Box::new(matches.into_iter())
        }
    }

    struct CountingSource {
        quads: Vec<Quad>,
        pulled: Arc<AtomicUsize>,
    }

    impl QuadPatternSource for CountingSource {
        fn quads_for_pattern(
            &self,
            _subject: Option<SubjectRef<'_>>,
            _predicate: Option<NamedNodeRef<'_>>,
            _object: Option<TermRef<'_>>,
            _contexts: Option<&[GraphNameRef<'_>]>,
        ) -> Box<dyn Iterator<Item = Quad> + Send> {
            let pulled = Arc::clone(&self.pulled);
            Box::new(self.quads.clone().into_iter().inspect(move |_| {
                pulled.fetch_add(1, AtomicOrdering::Relaxed);
            }))
        }
    }

    fn ex(name: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("http://example.com/{name}"))
    }

    fn var(name: &str) -> Variable {
        Variable::new_unchecked(name)
    }

    fn quad(s: &str, p: &str, o: impl Into<Term>) -> Quad {
        Quad::new(ex(s), ex(p), o, GraphName::DefaultGraph)
    }

    fn fixture() -> EvaluationStrategy {
        EvaluationStrategy::new(Arc::new(VecSource {
            quads: vec![
                quad("a", "knows", ex("b")),
                quad("b", "knows", ex("c")),
                quad("a", "name", Literal::new_simple_literal("Alice")),
                quad("b", "name", Literal::new_simple_literal("Bob")),
                quad("c", "name", Literal::new_simple_literal("Carol")),
            ],
        }))
    }

    fn solutions(strategy: &EvaluationStrategy, expr: &TupleExpr) -> Vec<BindingSet> {
        strategy
            .evaluate(expr, BindingSet::new())
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn knows_pattern(s: impl Into<TermPattern>, o: impl Into<TermPattern>) -> TupleExpr {
        TupleExpr::Pattern(StatementPattern::new(s, ex("knows"), o))
    }

    #[test]
    fn test_pattern_binds_variables() {
        let strategy = fixture();
        let rows = solutions(&strategy, &knows_pattern(var("x"), var("y")));
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .any(|r| r.get(&var("x")) == Some(&ex("a").into())
                && r.get(&var("y")) == Some(&ex("b").into())));

        // A variable used twice only matches when both positions agree.
        let rows = solutions(&strategy, &knows_pattern(var("x"), var("x")));
        assert!(rows.is_empty());
    }

    #[test]
    fn test_join_is_natural_join() {
        let strategy = fixture();
        let expr = knows_pattern(var("x"), var("y")).join(knows_pattern(var("y"), var("z")));
        let rows = solutions(&strategy, &expr);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&var("x")), Some(&ex("a").into()));
        assert_eq!(rows[0].get(&var("y")), Some(&ex("b").into()));
        assert_eq!(rows[0].get(&var("z")), Some(&ex("c").into()));

        // The same join through the hash path, with a non-pattern right side.
        let expr =
            knows_pattern(var("x"), var("y")).join(knows_pattern(var("y"), var("z")).distinct());
        assert_eq!(solutions(&strategy, &expr), rows);
    }

    #[test]
    fn test_union_difference_intersection() {
        let strategy = fixture();
        let ab = knows_pattern(ex("a"), var("y"));
        let bc = knows_pattern(var("x"), var("y"));

        let union = ab.clone().union(ab.clone());
        assert_eq!(solutions(&strategy, &union).len(), 2);
        assert_eq!(solutions(&strategy, &union.distinct()).len(), 1);

        let diff = ab.clone().difference(ab.clone());
        assert!(solutions(&strategy, &diff).is_empty());

        let inter = bc.clone().intersection(bc);
        assert_eq!(solutions(&strategy, &inter).len(), 2);
    }

    #[test]
    fn test_order_by_name() {
        let strategy = fixture();
        let names = TupleExpr::Pattern(StatementPattern::new(var("x"), ex("name"), var("n")));
        let asc = names
            .clone()
            .order(vec![OrderElem::asc(Expression::variable(&var("n")))]);
        let rows = solutions(&strategy, &asc);
        let values: Vec<_> = rows
            .iter()
            .map(|r| r.get(&var("n")).unwrap().clone())
            .collect();
        assert_eq!(
            values,
            vec![
                Literal::new_simple_literal("Alice").into(),
                Literal::new_simple_literal("Bob").into(),
                Literal::new_simple_literal("Carol").into(),
            ]
        );

        let desc = names.order(vec![OrderElem::desc(Expression::variable(&var("n")))]);
        let rows = solutions(&strategy, &desc);
        assert_eq!(
            rows[0].get(&var("n")),
            Some(&Literal::new_simple_literal("Carol").into())
        );
    }

    #[test]
    fn test_filter_error_is_non_match() {
        let strategy = fixture();
        // ?n is only bound on name statements; the comparison errors out on
        // solutions without it and those simply do not match.
        let all = TupleExpr::Pattern(StatementPattern::new(var("x"), ex("name"), var("n")))
            .union(knows_pattern(var("x"), var("y")));
        let filtered = all.filter(
            Expression::variable(&var("n")).compare(
                Comparator::Gt,
                Expression::constant(Literal::new_simple_literal("Alice")),
            ),
        );
        let rows = solutions(&strategy, &filtered);
        assert_eq!(rows.len(), 2); // Bob and Carol
    }

    #[test]
    fn test_extend_binds_computed_value() {
        let strategy = fixture();
        let expr = TupleExpr::Pattern(StatementPattern::new(ex("a"), ex("name"), var("n")))
            .extend(
                var("len"),
                Expression::FunctionCall(
                    builtin::STRLEN.into_owned(),
                    vec![Expression::variable(&var("n"))],
                ),
            );
        let rows = solutions(&strategy, &expr);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&var("len")), Some(&Literal::from(5_i64).into()));
    }

    fn knows_path(
        subject: impl Into<TermPattern>,
        object: impl Into<TermPattern>,
        min_length: u32,
    ) -> TupleExpr {
        TupleExpr::ArbitraryLengthPath {
            subject: subject.into(),
            path: Box::new(knows_pattern(var("__step_start"), var("__step_end"))),
            start: var("__step_start"),
            end: var("__step_end"),
            object: object.into(),
            min_length,
        }
    }

    #[test]
    fn test_path_closure() {
        let strategy = fixture();

        let rows = solutions(&strategy, &knows_path(ex("a"), var("o"), 1));
        let targets: FxHashSet<Term> = rows
            .into_iter()
            .map(|r| r.get(&var("o")).unwrap().clone())
            .collect();
        assert_eq!(targets, [ex("b").into(), ex("c").into()].into_iter().collect());

        let rows = solutions(&strategy, &knows_path(ex("a"), var("o"), 0));
        assert_eq!(rows.len(), 3); // a itself as well

        // Both endpoints bound.
        assert_eq!(solutions(&strategy, &knows_path(ex("a"), ex("c"), 1)).len(), 1);
        assert!(solutions(&strategy, &knows_path(ex("c"), ex("a"), 1)).is_empty());

        // Backward: who reaches c?
        let rows = solutions(&strategy, &knows_path(var("s"), ex("c"), 1));
        let sources: FxHashSet<Term> = rows
            .into_iter()
            .map(|r| r.get(&var("s")).unwrap().clone())
            .collect();
        assert_eq!(sources, [ex("a").into(), ex("b").into()].into_iter().collect());

        // Two steps minimum.
        let rows = solutions(&strategy, &knows_path(ex("a"), var("o"), 2));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&var("o")), Some(&ex("c").into()));
    }

    #[test]
    fn test_path_endpoint_comes_from_the_input_bindings() {
        let strategy = fixture();
        let mut input = BindingSet::new();
        input.bind(var("s"), ex("b").into());
        let rows: Vec<BindingSet> = strategy
            .evaluate(&knows_path(var("s"), var("o"), 1), input)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&var("s")), Some(&ex("b").into()));
        assert_eq!(rows[0].get(&var("o")), Some(&ex("c").into()));
    }

    #[test]
    fn test_order_stops_draining_its_input_at_the_size_limit() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let quads: Vec<Quad> = (0..100)
            .map(|i| quad(&format!("s{i}"), "p", ex(&format!("o{i}"))))
            .collect();
        let strategy = EvaluationStrategy::new(Arc::new(CountingSource {
            quads,
            pulled: Arc::clone(&pulled),
        }))
        .with_size_limit(5);
        let expr = TupleExpr::Pattern(StatementPattern::new(var("s"), var("p"), var("o")))
            .order(vec![OrderElem::asc(Expression::variable(&var("o")))]);
        let result: Result<Vec<_>, _> = strategy.evaluate(&expr, BindingSet::new()).collect();
        assert!(matches!(
            result,
            Err(QueryEvaluationError::SizeLimitExceeded { max_size: 5 })
        ));
        assert!(
            pulled.load(AtomicOrdering::Relaxed) <= 6,
            "input drained past the budget"
        );
    }

    #[test]
    fn test_size_limit_fails_the_query() {
        let bounded = fixture().with_size_limit(2);
        let expr = TupleExpr::Pattern(StatementPattern::new(var("x"), var("p"), var("o")))
            .distinct();
        let result: Result<Vec<_>, _> = bounded.evaluate(&expr, BindingSet::new()).collect();
        assert!(matches!(
            result,
            Err(QueryEvaluationError::SizeLimitExceeded { max_size: 2 })
        ));

        // The same plan without a budget runs to completion.
        let rows = solutions(&fixture(), &expr);
        assert_eq!(rows.len(), 5);
    }
}
