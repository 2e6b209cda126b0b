//! Donor-side write-set cache interface.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::action::ActionKind;
use crate::seqno::SeqNo;

/// One cached write-set, addressed by its global seqno.
#[derive(Clone, Debug)]
pub struct CacheBuffer {
    pub seqno_g: SeqNo,
    pub kind: ActionKind,
    pub data: Bytes,
}

/// Interface offered by the write-set cache.
///
/// A streaming session pins the seqno range it reads so the cache cannot
/// evict it; the pin is released with `seqno_unlock` when the session ends.
pub trait WriteSetCache: Send + Sync {
    /// Fill up to `max` contiguous buffers starting at `first`. Returns an
    /// empty vec when `first` is not in the cache.
    fn seqno_get_buffers(&self, first: SeqNo, max: usize) -> Vec<CacheBuffer>;

    /// Release the seqno range pinned by a streaming session.
    fn seqno_unlock(&self);
}

/// Contiguous in-memory cache, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryWriteSetCache {
    inner: Mutex<BTreeMap<i64, CacheBuffer>>,
}

impl InMemoryWriteSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, buf: CacheBuffer) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.insert(buf.seqno_g.get(), buf);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WriteSetCache for InMemoryWriteSetCache {
    fn seqno_get_buffers(&self, first: SeqNo, max: usize) -> Vec<CacheBuffer> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let mut out = Vec::new();
        let mut next = first.get();
        while out.len() < max {
            let Some(buf) = inner.get(&next) else {
                break;
            };
            out.push(buf.clone());
            next += 1;
        }
        out
    }

    fn seqno_unlock(&self) {}
}

#[cfg(test)]
mod tests {
    use super::{CacheBuffer, InMemoryWriteSetCache, WriteSetCache};
    use crate::action::ActionKind;
    use crate::seqno::SeqNo;
    use bytes::Bytes;

    fn buf(seqno: i64) -> CacheBuffer {
        CacheBuffer {
            seqno_g: SeqNo::new(seqno),
            kind: ActionKind::WriteSet,
            data: Bytes::from(seqno.to_be_bytes().to_vec()),
        }
    }

    #[test]
    fn reads_are_contiguous_and_bounded() {
        let cache = InMemoryWriteSetCache::new();
        for seqno in [3, 4, 5, 7] {
            cache.insert(buf(seqno));
        }

        let got = cache.seqno_get_buffers(SeqNo::new(3), 10);
        let seqnos: Vec<i64> = got.iter().map(|b| b.seqno_g.get()).collect();
        assert_eq!(seqnos, vec![3, 4, 5], "stops at the gap before 7");

        let got = cache.seqno_get_buffers(SeqNo::new(3), 2);
        assert_eq!(got.len(), 2, "respects max");
    }

    #[test]
    fn missing_start_returns_empty() {
        let cache = InMemoryWriteSetCache::new();
        cache.insert(buf(5));
        assert!(cache.seqno_get_buffers(SeqNo::new(4), 4).is_empty());
    }
}
