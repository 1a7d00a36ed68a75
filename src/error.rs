//! Error types for the gossip layer.

use crate::message::DecodeError;
use std::fmt;

/// Result type alias for gossip operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during gossip operations.
#[derive(Debug)]
pub enum Error {
    /// Broadcast payload exceeds the configured maximum size.
    MessageTooLarge {
        /// Size of the payload in bytes.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// Invalid configuration (bad epoch, node id out of range, ...).
    ///
    /// Raised at construction time only. A node that cannot build a valid
    /// identity generator must not join the cluster.
    Config(String),

    /// Failed to decode a gossip envelope.
    Decode(DecodeError),

    /// A push/pull exchange with a peer failed.
    Transport(String),

    /// The gossip instance has been shut down.
    Shutdown,
}

impl Error {
    /// Returns `true` if this is a shutdown error.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }

    /// Returns `true` if retrying the same operation cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::MessageTooLarge { .. } | Error::Config(_) | Error::Decode(_) | Error::Shutdown
        )
    }

    /// Returns `true` if a later retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MessageTooLarge { size, max_size } => {
                write!(
                    f,
                    "message size ({} bytes) exceeds maximum ({} bytes)",
                    size, max_size
                )
            }
            Error::Config(msg) => {
                write!(f, "configuration error: {}", msg)
            }
            Error::Decode(err) => {
                write!(f, "failed to decode message: {}", err)
            }
            Error::Transport(msg) => {
                write!(f, "push/pull exchange failed: {}", msg)
            }
            Error::Shutdown => {
                write!(f, "gossip instance has been shut down")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}
