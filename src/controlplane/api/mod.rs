//! API Module
//!
//! REST surface over the guest orchestrator and the task engine.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
