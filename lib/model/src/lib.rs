mod namespace;

pub use namespace::Namespace;

// Re-export the oxrdf data model.
pub use oxiri::Iri;
pub use oxrdf::vocab;
pub use oxrdf::{
    BlankNode, BlankNodeIdParseError, BlankNodeRef, GraphName, GraphNameRef, IriParseError,
    LanguageTagParseError, Literal, LiteralRef, NamedNode, NamedNodeRef, NamedOrBlankNode,
    NamedOrBlankNodeRef, Quad, QuadRef, Subject, SubjectRef, Term, TermRef, Triple, TripleRef,
    Variable, VariableNameParseError, VariableRef,
};
