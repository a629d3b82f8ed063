//! Common utilities and shared components for Tether
//!
//! This crate provides shared functionality used across all Tether components,
//! including error types, identifiers and logging setup.
//!
//! # Module Organization
//!
//! - [`ids`]: Type-safe identifier newtypes (UpstreamId, ConnectionId)
//! - [`types`]: Common type definitions (LoadBalancingAlgorithm)
//! - [`errors`]: Error types and result aliases
//! - [`observability`]: Tracing subscriber initialization

pub mod errors;
pub mod ids;
pub mod observability;
pub mod types;

// Re-export error types
pub use errors::{TetherError, TetherResult};

// Re-export identifier types
pub use ids::{ConnectionId, UpstreamId};

// Re-export common types
pub use types::LoadBalancingAlgorithm;

pub use observability::init_tracing;
