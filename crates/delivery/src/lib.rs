//! Delivery control — per-account/per-domain rate limiting, warmup ramps,
//! and delivery-window scheduling.

pub mod rate_limit;
pub mod schedule;
pub mod warmup;

pub use rate_limit::{RateController, RateDecision};
pub use schedule::{ScheduleOutcome, SchedulingEngine};
pub use warmup::{WarmupEngine, WarmupOutcome};
