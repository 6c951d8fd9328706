//! The RDF data model: terms, quads and namespaces.

pub use quadmem_model::*;
