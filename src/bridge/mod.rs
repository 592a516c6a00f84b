//! Event bus bridge client.
//!
//! Talks to a remote bus bridge over one persistent stream connection.
//! Every exchange is a single frame carrying one JSON record.
//!
//! # Architecture
//!
//! ```text
//! caller ──send/publish/register──► BridgeClient ──write lock──► WriteHalf ──► peer
//!                                       │
//! caller / Dispatcher ◄───receive()─────┴──────── ReadHalf ◄──────────────── peer
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 BE length][JSON record]`
//!
//! See [`framing`] for the frame codec and [`message`] for the record shape.

pub mod client;
pub mod framing;
pub mod message;

use std::io;
use std::time::Duration;

pub use client::BridgeClient;
pub use framing::{read_frame, write_frame, FrameDecoder, FrameReader, DEFAULT_MAX_FRAME_SIZE};
pub use message::{Failure, Message, MessageKind};

/// Errors that can occur while talking to the bridge.
#[derive(Debug)]
pub enum BridgeError {
    /// The connection to the bridge could not be established.
    ConnectionFailed {
        /// Address that was dialed.
        address: String,
        /// Underlying socket error.
        source: io::Error,
    },
    /// Read or write failed on an established connection.
    ///
    /// A peer that closes mid-frame surfaces here as `UnexpectedEof`.
    Transport(io::Error),
    /// The client was closed locally.
    Closed,
    /// A frame length exceeds the configured maximum.
    FrameTooLarge {
        /// Declared or encoded payload length.
        length: usize,
        /// Configured maximum.
        max: u32,
    },
    /// A record could not be serialized.
    Encode(serde_json::Error),
    /// A received payload could not be parsed into a record.
    Decode(serde_json::Error),
    /// No reply arrived for a request within its deadline.
    Timeout {
        /// Address the request was sent to.
        address: String,
        /// Deadline that expired.
        after: Duration,
    },
    /// A dispatcher operation was called in a lifecycle state that forbids it.
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the dispatcher was in.
        state: &'static str,
    },
}

impl BridgeError {
    /// Returns `true` if this error means the connection is gone.
    ///
    /// Callers use this to decide whether to build a new client.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed { address, source } => {
                write!(f, "Connection to {address} failed: {source}")
            }
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Closed => write!(f, "Bridge connection closed"),
            Self::FrameTooLarge { length, max } => {
                write!(f, "Frame too large: {length} bytes (max {max})")
            }
            Self::Encode(e) => write!(f, "Encoding error: {e}"),
            Self::Decode(e) => write!(f, "Decoding error: {e}"),
            Self::Timeout { address, after } => {
                write!(f, "No reply from {address} within {after:?}")
            }
            Self::InvalidState { operation, state } => {
                write!(f, "Cannot {operation} while dispatcher is {state}")
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectionFailed { source, .. } => Some(source),
            Self::Transport(e) => Some(e),
            Self::Encode(e) | Self::Decode(e) => Some(e),
            Self::Closed
            | Self::FrameTooLarge { .. }
            | Self::Timeout { .. }
            | Self::InvalidState { .. } => None,
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}
