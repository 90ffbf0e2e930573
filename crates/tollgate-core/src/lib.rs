//! Shared foundation for the tollgate gateway: configuration, the error
//! taxonomy every handler maps into, JWT claim validation, domain events,
//! and the generation-config types used across crates.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use error::{ApiError, Result};
