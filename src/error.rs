//! IST error taxonomy.

use thiserror::Error;

use crate::handler::ApplyError;
use crate::seqno::SeqNo;

/// Everything that can terminate an IST session or reject its setup.
#[derive(Debug, Error)]
pub enum IstError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("session interrupted")]
    Interrupted,
    #[error("first write-set seqno {got} ahead of requested start {first}")]
    StartSeqno { got: SeqNo, first: SeqNo },
    #[error("unexpected write-set seqno {got}, expected {expected}")]
    SeqnoMismatch { got: SeqNo, expected: SeqNo },
    #[error("write-set stream ended at {current}, expected last {last}")]
    Truncated { current: SeqNo, last: SeqNo },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer reported error code {0}")]
    PeerError(i32),
    #[error("protocol version {proposed} outside supported range {min}..={max}")]
    Version { proposed: u8, min: u8, max: u8 },
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),
}

impl IstError {
    /// Whether a terminal error should be kept in the receiver's persistent
    /// error slot. Cancellation is not recorded, so a later caller can tell
    /// it apart from a real failure.
    pub(crate) fn is_recordable(&self) -> bool {
        !matches!(self, IstError::Interrupted)
    }
}
