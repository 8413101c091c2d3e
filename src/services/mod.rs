pub mod llm_oracle;
pub mod oracle;
pub mod progress_tracker;
pub mod reference_validator;
pub mod result_combiner;
pub mod result_store;

pub use llm_oracle::LlmOracle;
pub use oracle::{DocumentContext, MatchOracle, OracleAnswer};
pub use progress_tracker::ProgressTracker;
pub use reference_validator::{ReferenceValidator, ValidatedOutcome};
pub use result_combiner::{CombinedReport, ResultCombiner};
pub use result_store::{BlobStore, FileBlobStore, MemoryBlobStore, ResultStore, StorageStats};
