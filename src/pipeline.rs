pub mod build;
pub mod collect;
pub mod compose;
pub mod generate;
pub mod output;
pub mod rank;
pub mod render;
pub mod scoring;

pub use build::{BuildOutcome, BuilderSettings, DigestBuilder};
pub use collect::{CollectReport, Collector};
pub use generate::{GenerateError, GenerateSettings, GeneratedDigest, OneShotGenerator};
pub use output::{DigestSink, FileDigestSink};
