//! The FIX session core: codec, pools, log store and the session state
//! machine.
//!
//! Submodules follow the wire: [`decode`] frames inbound bytes into pooled
//! [`mem::IncomingMessage`] views, [`session`] runs the administrative
//! state machine over them, [`encode`] assembles outbound frames, and
//! [`store`] keeps the append-only message log that backs resend.

use std::fmt;
use thiserror::Error;

pub mod checksum;
pub mod clock;
pub mod decode;
pub mod encode;
pub mod fields;
pub mod mem;
pub mod pool;
pub mod session;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

/// A session identity: the (SenderCompID, TargetCompID) pair, rendered
/// `"<sender>-><target>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    sender_comp_id: String,
    target_comp_id: String,
}

impl SessionId {
    pub fn new(sender_comp_id: &str, target_comp_id: &str) -> Self {
        SessionId {
            sender_comp_id: sender_comp_id.to_string(),
            target_comp_id: target_comp_id.to_string(),
        }
    }

    pub fn sender_comp_id(&self) -> &str {
        &self.sender_comp_id
    }

    pub fn target_comp_id(&self) -> &str {
        &self.target_comp_id
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sender_comp_id, self.target_comp_id)
    }
}

/// Everything that can go wrong on a live session.
///
/// Codec and protocol variants are fatal to the current connection; the
/// session disconnects and reports the error as the disconnect cause.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("An I/O error occured: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt frame ({}): {0}", .0.code())]
    Frame(#[from] decode::FrameError),
    #[error("CompID problem: message 49/56 do not match this session")]
    CompIdMismatch,
    #[error("Message is missing MsgType(35)")]
    MissingMsgType,
    #[error("Message is missing MsgSeqNum(34)")]
    MissingMsgSeqNum,
    #[error("Sequence number too low: expected {expected}, received {received}")]
    SequenceTooLow { expected: u32, received: u32 },
    #[error("TestRequest timeout")]
    TestRequestTimeout,
    #[error("Cannot send in state {0:?}")]
    NotLoggedOn(session::SessionState),
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("No channel bound to session")]
    NoChannel,
    #[error("Log store failure: {0}")]
    Store(#[from] store::StoreError),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_id_rendering() {
        let id = SessionId::new("CLIENT", "SERVER");
        assert_eq!(id.to_string(), "CLIENT->SERVER");
        assert_eq!(id.sender_comp_id(), "CLIENT");
        assert_eq!(id.target_comp_id(), "SERVER");
    }

    #[test]
    fn frame_errors_surface_their_code() {
        let err = SessionError::from(decode::FrameError::ChecksumMisplaced);
        assert!(err.to_string().contains("-2"));
    }
}
