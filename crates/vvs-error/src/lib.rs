#![forbid(unsafe_code)]
//! Error types for the vvs workspace.
//!
//! Defines `VvsError` and a `Result<T>` alias used throughout. There is
//! no recoverable error class: the driver treats every kind as fatal,
//! and an unmapped read is not an error at all (it resolves to TTE 0).

use thiserror::Error;

/// Unified error type for all simulator operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VvsError {
    #[error("unknown opcode {0}")]
    BadOpcode(u64),

    #[error("malformed command: {0}")]
    MalformedCommand(&'static str),

    #[error("bad numeric operand {token:?}: {reason}")]
    BadNumber {
        token: String,
        reason: &'static str,
    },

    #[error("no such volume id {0}")]
    NoSuchVolume(u64),

    #[error("no such snapshot {0:?}")]
    NoSuchSnapshot(String),

    #[error("block address {addr:#x} outside the {bits}-bit page space")]
    AddressOutOfRange { addr: u64, bits: u32 },

    /// Fatal: the refcount registry and the tree disagree. Indicates a
    /// bug in the engine, never bad input.
    #[error("refcount invariant broken on node {node}: observed count {count}")]
    RefcountViolation { node: u64, count: u64 },

    /// Fatal: structural corruption of the translation tree.
    #[error("translation tree invariant broken: {0}")]
    BrokenInvariant(&'static str),
}

/// Result alias using `VvsError`.
pub type Result<T> = std::result::Result<T, VvsError>;
