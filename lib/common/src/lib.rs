pub mod error;
mod handler;
mod quad_source;

pub use handler::StatementHandler;
pub use quad_source::QuadPatternSource;
