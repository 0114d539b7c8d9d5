//! Cadence SDK
//!
//! Shared library providing the types and error taxonomy used by the
//! Cadence engine and its external collaborators: step backend
//! implementations, persistence stores, and progress consumers.

/// Error types and handling
pub mod errors;

/// Role, usage, and step output types
pub mod types;

// Re-export commonly used types
pub use errors::{CadenceErrorExt, OrchestratorError};
pub use types::{Role, StepOutput, Usage};
