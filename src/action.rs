//! Ordered actions carried over the IST channel.

use bytes::Bytes;

use crate::seqno::SeqNo;

/// Kind of an ordered action in the global seqno space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// A committed transaction's replicated payload.
    WriteSet,
    /// A cluster configuration change, ordered in the same seqno space.
    Cchange,
    /// Never sent as a payload type. An `Unknown` action with seqno 0 and an
    /// empty buffer marks application-layer EOF.
    Unknown,
}

impl ActionKind {
    pub(crate) fn wire_tag(self) -> Option<u8> {
        match self {
            ActionKind::WriteSet => Some(1),
            ActionKind::Cchange => Some(2),
            ActionKind::Unknown => None,
        }
    }

    pub(crate) fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ActionKind::WriteSet),
            2 => Some(ActionKind::Cchange),
            _ => None,
        }
    }
}

/// One ordered action received from the IST channel.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteSetAction {
    pub seqno_g: SeqNo,
    pub kind: ActionKind,
    pub buf: Bytes,
}

impl WriteSetAction {
    /// Application-layer EOF marker.
    pub fn eof() -> Self {
        Self {
            seqno_g: SeqNo::new(0),
            kind: ActionKind::Unknown,
            buf: Bytes::new(),
        }
    }

    pub fn is_eof(&self) -> bool {
        self.kind == ActionKind::Unknown
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }
}
