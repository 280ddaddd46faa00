//! Strata - layered long-term memory for autonomous agents
//!
//! This crate implements a knowledge store with three memory tiers:
//! short-lived episodes, durable facts, and learned behavioral rules.
//! A consolidation pipeline distills episodes into facts and rules via
//! an external extraction agent; confidence decay and a maturity state
//! machine govern each tier's lifecycle; retrieval fuses semantic and
//! keyword search under per-call scoring configuration.

pub mod config;
pub mod consolidation;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod retrieval;
pub mod service;
pub mod storage;
pub mod sweep;
pub mod testing;
pub mod token;

pub use config::Config;
pub use error::{MemoryError, Result};
pub use service::{CallerIdentity, MemoryService};
