//! Error types for devproxy

use thiserror::Error;

/// Result type alias using devproxy Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in devproxy operations
#[derive(Error, Debug)]
pub enum Error {
    /// KVM-related errors
    #[error("KVM error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    /// Memory-related errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// Device errors (bad transport, spawn failure, unexpected reply)
    #[error("Device error: {0}")]
    Device(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call errors
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Protocol wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] devproxy_protocol::ProtocolError),

    /// The peer closed the channel or the transport failed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A previous failure left the channel without a usable request/reply pairing
    #[error("Channel broken: {0}")]
    ChannelBroken(String),

    /// Timeout waiting for a reply
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// True when the error means the Link can no longer be used and the
    /// owning device must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::System(_)
                | Error::Protocol(_)
                | Error::ChannelClosed(_)
                | Error::ChannelBroken(_)
                | Error::Timeout(_)
        )
    }
}
