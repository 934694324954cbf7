//! # Noor Core - Personal AI Companion Kernel
//!
//! Rust implementation of the Noor kernel providing:
//! - A five-stage cognitive pipeline (understand, reason, decide, execute, learn)
//! - Agent lifecycle management with pause/resume and notification steering
//! - Policy enforcement with deny, approval and advisory-auth verdicts
//! - Three-tier memory (short-term, working, long-term) with decay
//! - Wildcard pub/sub event bus for kernel, agent and input events
//! - Circuit breakers and bounded retries around every stage and agent call
//!
//! ## Architecture
//!
//! The pipeline turns raw input into exactly one decision per call; the
//! kernel owns the shared services every stage leans on:
//! ```text
//!   user input →  ┌─────────────────────────────────────────┐
//!                 │            CognitiveLoop                │
//!                 │  understand → reason → decide           │
//!                 │                          │              │
//!                 │                  execute ─→ learn       │
//!                 └──────────────┬──────────────────────────┘
//!                                │
//!                 ┌──────────────┴──────────────────────────┐
//!                 │                Kernel                   │
//!                 │  ┌─────────┐ ┌─────────┐ ┌──────────┐   │
//!                 │  │ Agents  │ │ Policy  │ │  Memory  │   │
//!                 │  │Registry │ │ Engine  │ │  Engine  │   │
//!                 │  └─────────┘ └─────────┘ └──────────┘   │
//!                 │  ┌─────────┐ ┌─────────┐                │
//!                 │  │  Event  │ │ Health  │                │
//!                 │  │   Bus   │ │ Monitor │                │
//!                 │  └─────────┘ └─────────┘                │
//!                 └─────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod agent;
pub mod bus;
pub mod cognition;
pub mod kernel;
pub mod memory;
pub mod policy;
pub mod resilience;
pub mod types;

// Internal utilities
pub mod observability;

pub use cognition::CognitiveLoop;
pub use kernel::Kernel;
pub use types::{Config, Error, Result};
