//! huddle-core - Core library for Huddle
//!
//! This crate provides the domain logic shared by the Huddle server:
//!
//! - **db**: Direct SQLite database access
//! - **types**: Shared entity and wire types
//! - **engine**: AI merge engine (meeting-memory folding)
//! - **auth**: Token-based authentication

pub mod auth;
pub mod db;
pub mod engine;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
