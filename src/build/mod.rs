//! Build orchestration: the container-bound worker pool and the per-job
//! build executor.

pub mod executor;
pub mod pool;

pub use executor::{BuildError, BuildVariant, Executor};
