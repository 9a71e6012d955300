//! Shared configuration, instrument catalogue, and utilities.

pub mod catalogue;
pub mod config;
pub mod error;

pub use catalogue::Catalogue;
pub use config::{ServerConfig, UpstreamConfig};
pub use error::{CatalogueError, ConfigError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
