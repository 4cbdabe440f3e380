pub mod entry;
pub mod output;

pub use entry::{normalize_metadata, HistoryEntry, Metadata};
pub use output::{normalize_outputs, OutputRecord, OutputRejection};
