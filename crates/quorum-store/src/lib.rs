pub mod context;
pub mod error;
pub mod journal;
pub mod memory;
pub mod records;
pub mod sqlite;

pub use context::{ContextProvider, ContextReader, EmptyContextProvider};
pub use error::StoreError;
pub use journal::{JournalEntry, JournalRecord, SignalJournal};
pub use records::RecordStore;
pub use sqlite::SqliteCache;
