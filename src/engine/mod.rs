//! Batch engine: the pipeline seam and the scheduler that drives it.

pub mod pipeline;
pub mod scheduler;

pub use pipeline::Pipeline;
pub use scheduler::{BATCH_DIR, RunOptions, RunPaths, RunReport, Scheduler, SchedulerConfig};
