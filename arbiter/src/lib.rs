pub mod arbitrator;
pub mod config;
pub mod controller_finder;
pub mod error;
pub mod filter;
pub mod index;
pub mod limiter;
pub mod metrics;
pub mod queue;
pub mod sort;

pub use arbitrator::Arbitrator;
pub use config::ArbiterConfig;
pub use controller_finder::KubeControllerFinder;
pub use error::{Error, Result};
