//! Core types for the Noor kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (AgentId, MemoryId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures composed from per-component sections
//! - **Enums**: Small shared enums (Priority)

mod config;
mod enums;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig};
pub use enums::Priority;
pub use errors::{Error, Result};
pub use ids::{AgentId, DecisionId, EventId, MemoryId, PolicyId, SubscriptionId};
