//! Audit — provenance event log, BLAKE3 desired-state hashing, drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
