pub mod memory;

pub use memory::{
    MemStatementIter, MemStoreReader, MemTransaction, MemoryStore, MemoryStoreBulkLoader,
    NamespaceStore, ReadMode, Statement, TxnStatus,
};
pub use memory::persistence::{read_snapshot, write_snapshot, FormatError};
