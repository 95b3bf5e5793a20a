//! Admission decisions and limit rules.

mod decision;
mod limiter;
mod rules;

pub use decision::{check, Decision};
pub use limiter::RateLimiter;
pub use rules::{LimitRule, RulesConfig, TimeUnit};
