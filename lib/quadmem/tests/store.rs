#![allow(clippy::panic_in_result_fn)]

use quadmem::model::*;
use quadmem::query::{
    Comparator, Expression, QueryEvaluationError, StatementPattern, TupleExpr,
};
use quadmem::store::{Statement, StatementHandler, StorageError, Store};
use std::collections::HashSet;

fn ex(name: &str) -> NamedNode {
    NamedNode::new_unchecked(format!("http://example.com/{name}"))
}

fn var(name: &str) -> Variable {
    Variable::new_unchecked(name)
}

fn quad(s: &str, p: &str, o: &str, g: Option<&str>) -> Quad {
    Quad::new(
        ex(s),
        ex(p),
        ex(o),
        match g {
            Some(g) => GraphName::from(ex(g)),
            None => GraphName::DefaultGraph,
        },
    )
}

#[test]
fn test_insert_remove_and_contains() -> Result<(), StorageError> {
    let store = Store::new();
    let q = quad("a", "p", "b", None);
    assert!(store.insert(q.as_ref())?);
    assert!(!store.insert(q.as_ref())?);
    assert!(store.contains(q.as_ref()));
    assert_eq!(store.len(), 1);

    assert!(store.remove(q.as_ref())?);
    assert!(!store.remove(q.as_ref())?);
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn test_running_iterators_keep_their_snapshot() -> Result<(), StorageError> {
    let store = Store::new();
    store.insert(quad("a", "p", "b", None).as_ref())?;
    store.insert(quad("a", "p", "c", None).as_ref())?;

    let iter = store.statements_for_pattern(None, None, None, None);
    store.insert(quad("a", "p", "d", None).as_ref())?;
    store.remove(quad("a", "p", "b", None).as_ref())?;

    // The open scan still sees the state it was created against.
    assert_eq!(iter.count(), 2);
    assert_eq!(
        store.statements_for_pattern(None, None, None, None).count(),
        2
    );
    assert_eq!(store.len(), 2);
    Ok(())
}

#[test]
fn test_dropped_transaction_rolls_back() -> Result<(), StorageError> {
    let store = Store::new();
    {
        let mut txn = store.begin()?;
        txn.add_statement(quad("a", "p", "b", None).as_ref(), true);
        txn.add_statement(quad("a", "p", "c", None).as_ref(), true);
    }
    assert!(store.is_empty());

    let result: Result<(), StorageError> = store.transaction(|txn| {
        txn.add_statement(quad("a", "p", "b", None).as_ref(), true);
        Err(StorageError::Other("boom".into()))
    });
    assert!(result.is_err());
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn test_begin_fails_while_a_transaction_is_active() -> Result<(), StorageError> {
    let store = Store::new();
    let _txn = store.begin()?;
    assert!(matches!(
        store.begin(),
        Err(StorageError::TransactionActive)
    ));
    Ok(())
}

#[test]
fn test_pattern_scan_grid() -> Result<(), StorageError> {
    let store = Store::new();
    let mut all = Vec::new();
    for s in 0..6 {
        for p in 0..5 {
            for o in 0..4 {
                let g = match (s + p + o) % 3 {
                    0 => None,
                    1 => Some("g1"),
                    _ => Some("g2"),
                };
                all.push(quad(&format!("s{s}"), &format!("p{p}"), &format!("o{o}"), g));
            }
        }
    }
    assert!(all.len() >= 100);
    store.transaction(|txn| {
        for q in &all {
            txn.add_statement(q.as_ref(), true);
        }
        Ok::<_, StorageError>(())
    })?;

    let subject = ex("s1");
    let predicate = ex("p2");
    let object = ex("o0");
    let context = ex("g1");
    for mask in 0..16u32 {
        let s = (mask & 1 != 0).then_some(&subject);
        let p = (mask & 2 != 0).then_some(&predicate);
        let o = (mask & 4 != 0).then_some(&object);
        let g = (mask & 8 != 0).then_some(&context);

        let expected: HashSet<Quad> = all
            .iter()
            .filter(|q| {
                s.map_or(true, |s| q.subject == Subject::from(s.clone()))
                    && p.map_or(true, |p| q.predicate == *p)
                    && o.map_or(true, |o| q.object == Term::from(o.clone()))
                    && g.map_or(true, |g| q.graph_name == GraphName::from(g.clone()))
            })
            .cloned()
            .collect();

        let contexts = g.map(|g| [GraphNameRef::from(g.as_ref())]);
        let actual: HashSet<Quad> = store
            .statements_for_pattern(
                s.map(|s| SubjectRef::from(s.as_ref())),
                p.map(NamedNode::as_ref),
                o.map(|o| TermRef::from(o.as_ref())),
                contexts.as_ref().map(<[GraphNameRef<'_>; 1]>::as_slice),
            )
            .map(Statement::into_quad)
            .collect();
        assert_eq!(actual, expected, "pattern combination {mask}");
    }
    Ok(())
}

#[test]
fn test_join_is_natural_join() -> Result<(), StorageError> {
    let store = Store::new();
    store.insert(quad("a", "knows", "b", None).as_ref())?;
    store.insert(quad("b", "knows", "c", None).as_ref())?;
    store.insert(quad("c", "knows", "d", None).as_ref())?;

    let expr = TupleExpr::Pattern(StatementPattern::new(var("x"), ex("knows"), var("y"))).join(
        TupleExpr::Pattern(StatementPattern::new(var("y"), ex("knows"), var("z"))),
    );
    let rows: HashSet<(Term, Term, Term)> = store
        .evaluate(&expr)
        .map(|row| {
            let row = row.unwrap();
            (
                row.get(&var("x")).unwrap().clone(),
                row.get(&var("y")).unwrap().clone(),
                row.get(&var("z")).unwrap().clone(),
            )
        })
        .collect();
    let expected: HashSet<(Term, Term, Term)> = [
        (ex("a").into(), ex("b").into(), ex("c").into()),
        (ex("b").into(), ex("c").into(), ex("d").into()),
    ]
    .into_iter()
    .collect();
    assert_eq!(rows, expected);
    Ok(())
}

#[test]
fn test_query_sees_removals() -> Result<(), StorageError> {
    let store = Store::new();
    store.insert(quad("a", "knows", "b", None).as_ref())?;
    store.insert(quad("a", "knows", "c", None).as_ref())?;

    let expr = TupleExpr::Pattern(StatementPattern::new(ex("a"), ex("knows"), var("who")));
    let who = |expr: &TupleExpr| -> HashSet<Term> {
        store
            .evaluate(expr)
            .map(|r| r.unwrap().get(&var("who")).unwrap().clone())
            .collect()
    };
    assert_eq!(
        who(&expr),
        [ex("b").into(), ex("c").into()].into_iter().collect()
    );

    store.remove(quad("a", "knows", "b", None).as_ref())?;
    assert_eq!(who(&expr), [ex("c").into()].into_iter().collect());
    Ok(())
}

#[test]
fn test_filter_and_order() -> Result<(), StorageError> {
    let store = Store::new();
    for (name, age) in [("alice", 42_i64), ("bob", 17), ("carol", 29)] {
        store.insert(
            Quad::new(
                ex(name),
                ex("age"),
                Literal::from(age),
                GraphName::DefaultGraph,
            )
            .as_ref(),
        )?;
    }

    let pattern = TupleExpr::Pattern(StatementPattern::new(var("who"), ex("age"), var("age")));
    let adults = pattern
        .filter(Expression::variable(&var("age")).compare(
            Comparator::Ge,
            Expression::constant(Literal::from(18_i64)),
        ))
        .order(vec![quadmem::query::OrderElem::desc(Expression::variable(
            &var("age"),
        ))]);
    let rows = store
        .evaluate(&adults)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(&var("who")), Some(&ex("alice").into()));
    assert_eq!(rows[1].get(&var("who")), Some(&ex("carol").into()));
    Ok(())
}

#[test]
fn test_bounded_evaluation_fails_instead_of_truncating() -> Result<(), StorageError> {
    let store = Store::new();
    for i in 0..20 {
        store.insert(quad("s", "p", &format!("o{i}"), None).as_ref())?;
    }
    let expr = TupleExpr::Pattern(StatementPattern::new(var("s"), var("p"), var("o"))).distinct();

    let bounded: Result<Vec<_>, _> = store.evaluate_bounded(&expr, 5).collect();
    assert!(matches!(
        bounded,
        Err(QueryEvaluationError::SizeLimitExceeded { max_size: 5 })
    ));

    let unbounded = store.evaluate(&expr).collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(unbounded.len(), 20);
    Ok(())
}

#[test]
fn test_save_and_load_round_trip() -> Result<(), StorageError> {
    let store = Store::new();
    store.set_namespace("ex", "http://example.com/");
    store.insert(quad("a", "p", "b", None).as_ref())?;
    store.insert(quad("a", "p", "c", Some("g1")).as_ref())?;
    store.insert(
        Quad::new(
            ex("a"),
            ex("label"),
            Literal::new_language_tagged_literal_unchecked("hello", "en"),
            GraphName::DefaultGraph,
        )
        .as_ref(),
    )?;
    // An inferred statement survives the round trip with its flag.
    store.transaction(|txn| {
        txn.add_statement(quad("a", "p", "d", None).as_ref(), false);
        Ok::<_, StorageError>(())
    })?;

    let mut bytes = Vec::new();
    store.save_to(&mut bytes)?;

    let restored = Store::new();
    restored.load_from(bytes.as_slice())?;
    assert_eq!(restored.namespace("ex").as_deref(), Some("http://example.com/"));

    let dump = |store: &Store| -> HashSet<(Quad, bool)> {
        store
            .statements_for_pattern(None, None, None, None)
            .map(|s| (s.quad().clone(), s.is_explicit()))
            .collect()
    };
    assert_eq!(dump(&restored), dump(&store));
    Ok(())
}

#[test]
fn test_save_to_file_and_load_from_file() -> Result<(), StorageError> {
    let store = Store::new();
    store.insert(quad("a", "p", "b", None).as_ref())?;

    let path = std::env::temp_dir().join(format!("quadmem-store-{}.bms", std::process::id()));
    store.save_to_file(&path)?;
    let restored = Store::new();
    restored.load_from_file(&path)?;
    std::fs::remove_file(&path)?;

    assert!(restored.contains(quad("a", "p", "b", None).as_ref()));
    assert_eq!(restored.len(), 1);
    Ok(())
}

#[test]
fn test_corrupt_input_loads_nothing() -> Result<(), StorageError> {
    let store = Store::new();
    store.insert(quad("a", "p", "b", None).as_ref())?;
    let mut bytes = Vec::new();
    store.save_to(&mut bytes)?;
    bytes.truncate(bytes.len() / 2);

    let target = Store::new();
    assert!(target.load_from(bytes.as_slice()).is_err());
    assert!(target.is_empty());
    Ok(())
}

#[derive(Default)]
struct CollectingHandler {
    started: bool,
    ended: bool,
    statements: Vec<Quad>,
    namespaces: Vec<(String, String)>,
}

impl StatementHandler for CollectingHandler {
    fn start(&mut self) -> Result<(), StorageError> {
        self.started = true;
        Ok(())
    }

    fn handle_statement(&mut self, statement: QuadRef<'_>) -> Result<(), StorageError> {
        self.statements.push(statement.into_owned());
        Ok(())
    }

    fn handle_namespace(&mut self, prefix: &str, iri: &str) -> Result<(), StorageError> {
        self.namespaces.push((prefix.to_owned(), iri.to_owned()));
        Ok(())
    }

    fn end(&mut self) -> Result<(), StorageError> {
        self.ended = true;
        Ok(())
    }
}

#[test]
fn test_export_pushes_everything() -> Result<(), StorageError> {
    let store = Store::new();
    store.set_namespace("ex", "http://example.com/");
    store.insert(quad("a", "p", "b", None).as_ref())?;
    store.insert(quad("a", "p", "c", Some("g1")).as_ref())?;

    let mut handler = CollectingHandler::default();
    store.export(&mut handler)?;
    assert!(handler.started && handler.ended);
    assert_eq!(handler.statements.len(), 2);
    assert_eq!(
        handler.namespaces,
        vec![("ex".to_owned(), "http://example.com/".to_owned())]
    );
    Ok(())
}

#[test]
fn test_bulk_loader_is_atomic_per_session() -> Result<(), StorageError> {
    let store = Store::new();
    let loaded = store
        .bulk_loader()
        .load_quads((0..10).map(|i| quad("s", "p", &format!("o{i}"), None)))?;
    assert_eq!(loaded, 10);
    assert_eq!(store.len(), 10);
    Ok(())
}
