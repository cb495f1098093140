//! Ferrite CD Core
//!
//! Core domain types, traits, and error handling for Ferrite CD.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod agent;
pub mod buildcause;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod instance;
pub mod material;
pub mod plan;
pub mod ports;
pub mod result;

pub use error::{Error, Result};
pub use ids::*;
