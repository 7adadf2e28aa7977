//! Host common library
//!
//! Provides basic functions shared by host-side services:
//! - error processing
//! - logging setup
//! - graceful shutdown

pub mod error;
pub mod logging;
pub mod shutdown;

// Re-export common dependencies
pub use anyhow;
pub use serde;
pub use serde_json;
pub use tokio;

// Pre-import common types
pub mod prelude {
    pub use crate::error::{Error, Result};
}
