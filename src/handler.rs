//! Apply pipeline interface consumed by the receiver.

use thiserror::Error;

use crate::action::WriteSetAction;
use crate::error::IstError;
use crate::seqno::SeqNo;

/// Failure raised by the apply pipeline while IST frames are dispatched.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("write-set unserialize failed at seqno {seqno}: {reason}")]
    Unserialize { seqno: SeqNo, reason: String },
    #[error("apply failed at seqno {seqno}: {reason}")]
    Apply { seqno: SeqNo, reason: String },
}

/// Receiver-side apply pipeline.
///
/// All methods run on the receive thread and must not re-enter the
/// receiver. `ist_end` is called exactly once per session, after the last
/// dispatch; no `ist_trx` or `ist_cc` call follows it.
pub trait EventHandler: Send {
    /// Apply handle produced by [`EventHandler::unserialize`] and consumed
    /// by [`EventHandler::ist_trx`].
    type Trx;

    /// Decode one WRITESET action into an apply handle. This is where the
    /// write-set's internal checksum is validated; the wire codec does not
    /// checksum.
    fn unserialize(
        &mut self,
        action: &WriteSetAction,
        keep_keys: bool,
    ) -> Result<Self::Trx, ApplyError>;

    /// Dispatch one transaction write-set. `must_apply` is false only for
    /// pre-SST overlap frames, which repopulate the local cache without
    /// being re-applied.
    fn ist_trx(&mut self, trx: Self::Trx, must_apply: bool, preload: bool)
    -> Result<(), ApplyError>;

    /// Dispatch one configuration change.
    fn ist_cc(
        &mut self,
        action: WriteSetAction,
        must_apply: bool,
        preload: bool,
    ) -> Result<(), ApplyError>;

    /// Terminal notification for the session.
    fn ist_end(&mut self, outcome: Result<(), &IstError>);
}
