//! Error type shared by the builders, the cache and the dispatchers.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Everything that can go wrong between a kernel request and its result.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The requested kernel shape breaks a build-time invariant. No code
    /// was generated and nothing was cached.
    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(String),

    /// More vector registers were requested than the ISA provides.
    #[error("vector register budget exceeded: {needed} registers needed, {available} available")]
    RegisterBudget {
        /// Registers the kernel shape requires.
        needed: usize,
        /// Physical registers of the selected ISA.
        available: usize,
    },

    /// The assembler could not reserve memory for code emission.
    #[error("failed to set up the assembler: {0}")]
    Assembler(#[source] Arc<io::Error>),

    /// Generated code could not be committed to executable memory.
    #[error("failed to commit generated code to executable memory")]
    Commit,

    /// The kernel rejected its input: an index outside the table, a bag
    /// running past the index array, or lengths that do not sum to the
    /// number of indices.
    #[error("input rejected by kernel bounds check")]
    BoundsCheck,

    /// A slice or shape passed to a safe wrapper does not match the
    /// declared dimensions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Assembler(Arc::new(err))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
