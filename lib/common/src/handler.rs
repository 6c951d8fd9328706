use crate::error::StorageError;
use quadmem_model::QuadRef;

/// A push-style sink for streams of statements and namespace declarations.
///
/// RDF parsers feed a store through this interface, and a store can export
/// its committed content by pushing it into any implementation.
pub trait StatementHandler {
    /// Signals the start of a statement stream.
    fn start(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Handles a single statement.
    fn handle_statement(&mut self, statement: QuadRef<'_>) -> Result<(), StorageError>;

    /// Handles a namespace declaration.
    fn handle_namespace(&mut self, prefix: &str, iri: &str) -> Result<(), StorageError>;

    /// Signals the end of the stream. Buffered implementations flush here.
    fn end(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
