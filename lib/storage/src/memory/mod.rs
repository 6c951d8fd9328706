//! In-memory MVCC statement store: interned values, versioned statement
//! nodes threaded into scan chains, single-writer transactions, pinned
//! snapshot readers, a bulk loader and the binary snapshot codec.

mod iter;
pub mod loader;
mod namespaces;
mod node;
pub mod persistence;
mod store;
mod value_registry;

pub use iter::{MemStatementIter, ReadMode, Statement};
pub use loader::{BulkLoadSession, MemoryStoreBulkLoader};
pub use namespaces::NamespaceStore;
pub use node::TxnStatus;
pub use store::{MemStoreReader, MemTransaction, MemoryStore};
pub use value_registry::{MemValueRegistry, ValueId};
