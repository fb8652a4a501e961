//! Environment-state orchestration for sequential suites.
//!
//! Units of work run in named environments. A fixed order of sequential units
//! shares one environment, each unit building on the state left by its
//! predecessors; independent units each own a private environment. Marker
//! files record which units started and completed, so any unit can be run on
//! its own: polluted environments are wiped and rebuilt, and missing
//! prerequisites are materialized first.
//!
//! - **[`core`]**: Pure logic (suite validation, pollution detection).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (markers, environments, locks,
//!   process execution).
//!
//! [`orchestrator`] and [`resolve`] combine the two into the per-unit
//! lifecycle; [`status`] reports it read-only.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod resolve;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
