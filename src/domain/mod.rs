//! Domain layer - Shared types and port definitions
//!
//! This module defines the value types and the collaborator ports that the
//! engine, drivers and orchestrator share, following hexagonal architecture
//! principles.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
