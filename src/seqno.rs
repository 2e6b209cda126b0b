//! Global sequence numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Global sequence number, totally ordered across the cluster.
///
/// Valid seqnos start at 1. `SeqNo::UNDEFINED` is the unset sentinel; it
/// never appears on the wire inside an ordered frame.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SeqNo(i64);

impl SeqNo {
    pub const UNDEFINED: SeqNo = SeqNo(-1);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_undefined(self) -> bool {
        self.0 == Self::UNDEFINED.0
    }

    /// The immediately following seqno.
    pub const fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }
}

impl From<i64> for SeqNo {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::SeqNo;

    #[test]
    fn undefined_sentinel() {
        assert!(SeqNo::UNDEFINED.is_undefined());
        assert!(!SeqNo::new(1).is_undefined());
        assert_eq!(SeqNo::UNDEFINED.get(), -1);
    }

    #[test]
    fn next_advances_by_one() {
        assert_eq!(SeqNo::new(5).next(), SeqNo::new(6));
    }

    #[test]
    fn ordering_follows_inner_value() {
        assert!(SeqNo::new(3) < SeqNo::new(4));
        assert!(SeqNo::UNDEFINED < SeqNo::new(0));
    }
}
