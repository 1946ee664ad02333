//! Cooperative cancellation for a running execution.

mod token;

pub use token::CancellationToken;
