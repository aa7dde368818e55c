//! aura-common: Shared error type, sandboxed HTTP client and retry policy
//! used across the AURA crates.

pub mod error;
pub mod retry;
pub mod sandbox;

pub use error::{AuraError, Result};
pub use retry::{RetryPolicy, Retryable};
pub use sandbox::SandboxClient;
