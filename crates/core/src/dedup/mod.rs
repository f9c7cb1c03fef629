//! Content deduplication index.

mod sqlite;
mod store;
mod types;

pub use sqlite::SqliteDedupIndex;
pub use store::{DedupError, DedupIndex};
pub use types::{DedupRecord, DuplicateConfidence, DuplicateReport};
