//! Shared types for the meshfed federation controller.

pub mod error;

pub use error::{FederationError, Result};
