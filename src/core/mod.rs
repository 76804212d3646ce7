//! Core provisioning logic — types, parsing, resolution, planning, retry,
//! state, execution.

pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod retry;
pub mod state;
pub mod types;
