//! Meshbridge Reliability -- reassembly, selective repeat, request dedupe.
//!
//! The pieces that turn lossy single-packet delivery into at-least-once
//! message delivery with exactly-once application effect:
//!   - per-sender reassembly buckets with TTL and reactive NACK emission
//!   - pluggable recovery strategies (simple / stage / window / window_fec)
//!   - the gateway-side dedupe cache with execution leases

pub mod dedupe;
pub mod reassembly;
pub mod strategy;

pub use dedupe::{DedupeCache, DedupeConfig, DedupeDecision};
pub use reassembly::{ChunkIngest, Reassembler, ReassemblyConfig};
pub use strategy::{ControlAction, ReliabilityMethod, Strategy};
