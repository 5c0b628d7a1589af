//! Render worker: claims queued renders and runs them through the pipeline.

pub mod config;
pub mod pool;

pub use config::WorkerConfig;
pub use pool::WorkerPool;
