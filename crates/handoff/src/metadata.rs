//! Listener metadata exchanged over the control channel.
//!
//! The metadata only describes the listening socket. The socket itself
//! reaches the replacement through descriptor inheritance at process
//! creation; the receiver uses this record to find and check it.

use serde::{Deserialize, Serialize};

/// Descriptor slot the listening socket occupies in the replacement process
/// (the fourth inherited descriptor, after stdin, stdout and stderr).
pub const INHERITED_LISTENER_FD: i32 = 3;

/// Request command sent by the replacement process.
pub const GET_LISTENER: &[u8] = b"get_listener";

/// Receive buffer for the metadata response. Responses must fit.
pub const MAX_METADATA_LEN: usize = 1024;

/// Description of a listening socket handed to a replacement process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerMetadata {
    /// Address the listener serves, as configured.
    pub addr: String,
    /// Descriptor number of the listener in the replacement process.
    pub fd: i32,
    /// Name of the descriptor, e.g. `tcp:127.0.0.1:3000`.
    pub filename: String,
}

impl ListenerMetadata {
    /// Describe a listener that will be inherited at [`INHERITED_LISTENER_FD`].
    pub fn inherited(addr: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            fd: INHERITED_LISTENER_FD,
            filename: filename.into(),
        }
    }

    /// Serialize to the compact JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
