//! Retry and circuit breaking for calls to external collaborators.
//!
//! Stages wrap their documentation, retrieval or model calls in
//! [`ResilienceExecutor::execute`] under a named policy from the engine
//! configuration.

mod breaker;
mod executor;
mod policy;

pub use breaker::{CircuitBreaker, CircuitState};
pub use executor::{ResilienceExecutor, ResilienceResult};
pub use policy::ResiliencePolicy;
