//! Composition of the cache, limiter, retry policy, task manager and
//! metrics collector into one guarded call path.

mod builder;
mod guard;

pub use builder::{GuardBuilder, Skjold};
pub use guard::{AvailabilityProbe, Guard, GuardSnapshot, GuardedRequest, TokenCounter};
