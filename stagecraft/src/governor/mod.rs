//! Budget and scope governance for a single execution.
//!
//! Both types are plain values owned by one execution; nothing in here is
//! shared across requests.

mod budget;
mod scope;

pub use budget::{Budget, BudgetDimension, BudgetLimits, ResourceUsage};
pub use scope::{check_scope, FileEdit, ProposedEdit, Scope, ScopeLimits, ScopeViolation};
