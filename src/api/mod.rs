//! API layer for keymanager
//!
//! Provides:
//! - REST handlers for the keystore endpoints
//! - Bearer token authentication

pub mod auth;
pub mod rest;
pub mod types;

pub use auth::AuthService;
pub use rest::{router, ApiError, AppState};
