//! An embeddable in-memory [RDF dataset](https://www.w3.org/TR/rdf11-concepts/#dfn-rdf-dataset)
//! with snapshot isolation and an iterator-based query evaluator.
//!
//! The entry point is the [`Store`] struct:
//! ```
//! use quadmem::model::*;
//! use quadmem::store::Store;
//!
//! let store = Store::new();
//!
//! // insertion
//! let ex = NamedNode::new("http://example.com")?;
//! let quad = Quad::new(ex.clone(), ex.clone(), ex.clone(), GraphName::DefaultGraph);
//! store.insert(quad.as_ref())?;
//!
//! // pattern scan
//! let results: Vec<Quad> = store
//!     .statements_for_pattern(None, None, None, None)
//!     .map(|s| s.into_quad())
//!     .collect();
//! assert_eq!(vec![quad], results);
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

pub mod model;
pub mod query;
pub mod store;

pub use crate::store::Store;
