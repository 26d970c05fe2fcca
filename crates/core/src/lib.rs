//! OpsGate Core - Domain types
//!
//! This crate contains the fundamental types used across OpsGate:
//! - `Actor`: Externally-resolved identity of whoever is calling the engine
//! - `RiskLevel`: Risk classification for gated operation types

pub mod actor;
pub mod risk;

pub use actor::Actor;
pub use risk::{RiskLevel, RiskLevelError};
