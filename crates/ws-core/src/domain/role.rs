//! Which end of the connection we are, and the masking rule that follows.

use crate::protocol::frame::FrameError;

/// The side of a connection.
///
/// RFC 6455 makes masking direction-dependent: every frame a client sends is
/// masked and every frame a server sends is not.  A peer breaking this rule
/// is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Frames sent from this side carry a masking key.
    pub fn masks_outgoing(self) -> bool {
        self == Role::Client
    }

    /// Frames received on this side must carry a masking key.
    pub fn must_receive_masked(self) -> bool {
        self == Role::Server
    }

    /// Checks the MASK bit of an incoming frame against this role.
    ///
    /// # Errors
    ///
    /// [`FrameError::UnmaskedFrame`] on a server, [`FrameError::UnexpectedMask`]
    /// on a client.
    pub fn validate_incoming(self, masked: bool) -> Result<(), FrameError> {
        match (self.must_receive_masked(), masked) {
            (true, false) => Err(FrameError::UnmaskedFrame),
            (false, true) => Err(FrameError::UnexpectedMask),
            _ => Ok(()),
        }
    }
}
