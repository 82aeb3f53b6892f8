//! Shared foundation for the Cadence outreach engine: domain types,
//! error taxonomy, configuration, clock abstraction, and event bus.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use error::{CadenceError, CadenceResult};
