mod blob;
mod results;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore, DEFAULT_QUOTA_BYTES};
pub use results::{AppendOutcome, ResultStore, MAX_STORED_RESULTS};

/// Blob key holding the analysis history.
pub const ANALYSIS_RESULTS_KEY: &str = "analysis_results";
