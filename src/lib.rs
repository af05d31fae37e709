// Commerce Graph - channel-scoped entity graph with generic record mapping

// Core types and primitives
pub mod core;

// Entity model, registry, record mapper and repositories
pub mod framework;

// Storage and caching infrastructure
pub mod infrastructure;

// Commerce entity definitions
pub mod schemas;

// HTTP surface
pub mod app_state;
pub mod commerce_interface;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use error::{AppError, AppResult};
