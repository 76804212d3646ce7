//! andamio — idempotent, dependency-ordered provisioning.
//!
//! Declare external resources and the order they depend on each other; andamio
//! walks the graph, calls an adapter per resource, treats "already exists" as
//! success, retries what is transient, and records every transition so an
//! interrupted run resumes where it stopped.

pub mod adapter;
pub mod audit;
pub mod cli;
pub mod core;
