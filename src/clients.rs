pub mod source;
pub mod summarizer;

pub use source::{SourceClient, SourceClientConfig, SourceFetcher, SourceSpec};
pub use summarizer::{LlmSummarizer, LlmSummarizerConfig, NoopSummarizer, Summarizer};
