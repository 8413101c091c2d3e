pub mod loaders;
pub mod outcome;
pub mod progress;
pub mod record;
pub mod usage;
pub mod work_item;

pub use loaders::{load_catalog, parse_catalog};
pub use outcome::{batch_confidence_score, Confidence, MatchOutcome};
pub use progress::{progress_percentage, JobStatus, ProgressSnapshot};
pub use record::{AttemptInfo, BatchRecord, RecordStatus, ReferenceDiagnostics};
pub use usage::{ModelPricing, TokenUsage};
pub use work_item::{batch_count, split_into_batches, Batch, WorkItem};
