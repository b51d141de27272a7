//! Resource guards: rate limiting, bounded concurrency, input-size checks

pub mod fuzzy;
pub mod pool;
pub mod rate_limit;

pub use fuzzy::{EditValidation, FuzzyGuard, GuardMetrics, clamp_max_suggestions, clamp_threshold};
pub use pool::{PoolMetrics, PoolPriority, RequestPool};
pub use rate_limit::{LimiterMetrics, RateLimiter, Threshold};
