pub mod bucket;
pub mod executor;
pub mod metrics;
mod runner;
pub mod scheduler;
pub mod thresholds;
pub mod timeseries;
pub mod vu;

pub use bucket::LeakyBucket;
pub use executor::Executor;
pub use metrics::{MetricsConfig, MetricsEngine};
pub use runner::Engine;
pub use scheduler::VuScheduler;
pub use thresholds::evaluate_thresholds;
pub use timeseries::TimeBucketStore;
pub use vu::VirtualUser;
