//! Ballast Core Library
//!
//! Shared types, errors, and the IPC authorization model used across all
//! Ballast components.

pub mod auth;
pub mod error;
pub mod types;

pub use auth::{AccessPolicy, AuthContext, AuthType};
pub use error::{Error, Result};
pub use types::*;
