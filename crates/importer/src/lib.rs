pub mod job;
pub mod pipeline;
pub mod worker;

pub use job::ImportJob;
pub use pipeline::{ImportPipeline, ImportSummary};
pub use worker::ImportWorker;
