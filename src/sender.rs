//! IST sender engine and outbound session supervision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::cache::WriteSetCache;
use crate::config::{IstConfig, Scheme, resolve_peer};
use crate::error::IstError;
use crate::proto::{CTRL_ERR_VERSION, Ctrl, Proto, negotiate};
use crate::seqno::SeqNo;
use crate::stream::{IstStream, ShutdownHandle};

/// Batch size for reads from the write-set cache.
const SEND_BATCH: usize = 1024;

/// Donor-side IST engine: one connected outbound session.
///
/// Dropping the sender closes the connection and releases the cache range
/// pinned for streaming.
pub struct Sender<C: WriteSetCache> {
    stream: IstStream,
    proto: Proto,
    cache: Arc<C>,
}

impl<C: WriteSetCache> Sender<C> {
    /// Resolve and connect to the joiner's advertised receive address.
    pub fn connect(
        config: &IstConfig,
        cache: Arc<C>,
        peer: &str,
        version: u8,
    ) -> Result<Self, IstError> {
        let addr = resolve_peer(config, peer)?;
        if addr.scheme == Scheme::Ssl {
            tracing::info!("IST sender using ssl");
        }
        let stream = IstStream::connect(&addr, config.tls.as_ref())?;
        Ok(Self {
            stream,
            proto: Proto::new(version, config.keep_keys),
            cache,
        })
    }

    pub(crate) fn shutdown_handle(&self) -> std::io::Result<ShutdownHandle> {
        self.stream.shutdown_handle()
    }

    /// Stream `[first..last]` to the joiner in seqno order, then drain EOF.
    pub fn send(
        &mut self,
        mut first: SeqNo,
        last: SeqNo,
        preload_start: SeqNo,
    ) -> Result<(), IstError> {
        let proposed = self.proto.recv_handshake(&mut self.stream)?;
        let agreed = match negotiate(proposed, self.proto.version()) {
            Ok(agreed) => agreed,
            Err(err) => {
                let _ = self
                    .proto
                    .send_ctrl(&mut self.stream, Ctrl::Err(CTRL_ERR_VERSION));
                return Err(err);
            }
        };
        self.proto.set_version(agreed);
        self.proto.send_handshake_response(&mut self.stream)?;
        if let Ctrl::Err(code) = self.proto.recv_ctrl(&mut self.stream)? {
            return Err(IstError::PeerError(code));
        }

        // Send EOF even when there is nothing to stream: the joiner is
        // fully caught up from SST alone.
        if first > last || (first.get() == 0 && last.get() == 0) {
            tracing::info!("IST sender notifying joiner, not sending anything");
            return self.proto.send_eof(&mut self.stream);
        }
        tracing::info!("IST sender {first} -> {last}");

        loop {
            let batch = usize::try_from(last.get() - first.get() + 1)
                .unwrap_or(SEND_BATCH)
                .min(SEND_BATCH);
            let bufs = self.cache.seqno_get_buffers(first, batch);
            if bufs.is_empty() {
                return Err(IstError::Protocol(format!(
                    "write-set cache returned no buffers at {first}"
                )));
            }

            for buf in &bufs {
                // Preload start is the seqno of the lowest trx in the cert
                // index at CC. Zero means the index was fully reset and no
                // preload flag should be set.
                let preload = preload_start.get() > 0 && buf.seqno_g >= preload_start;
                self.proto.send_ordered(&mut self.stream, buf, preload)?;
                if buf.seqno_g == last {
                    return self.proto.send_eof(&mut self.stream);
                }
            }
            first = SeqNo::new(first.get() + bufs.len() as i64);
        }
    }
}

impl<C: WriteSetCache> Drop for Sender<C> {
    fn drop(&mut self) {
        self.stream.close();
        self.cache.seqno_unlock();
    }
}

struct SenderSlot {
    peer: String,
    shutdown: ShutdownHandle,
    done: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Supervises outbound IST sessions running on background threads.
///
/// The supervisor owns every worker's join handle; workers flag completion
/// and are reaped on the next `run` or drained by `cancel`.
pub struct AsyncSenderMap<C: WriteSetCache> {
    config: IstConfig,
    cache: Arc<C>,
    senders: Mutex<HashMap<u64, SenderSlot>>,
    next_id: AtomicU64,
}

impl<C: WriteSetCache> AsyncSenderMap<C> {
    pub fn new(config: IstConfig, cache: Arc<C>) -> Self {
        Self {
            config,
            cache,
            senders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Number of registered outbound sessions, finished ones included
    /// until their next reap.
    pub fn active_senders(&self) -> usize {
        self.senders.lock().expect("sender map lock poisoned").len()
    }

    /// Cancel all outbound sessions: shut their sockets down to unblock
    /// in-flight I/O, then join each worker. The map lock is not held
    /// across the joins.
    pub fn cancel(&self) {
        let drained: Vec<SenderSlot> = {
            let mut senders = self.senders.lock().expect("sender map lock poisoned");
            senders.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            slot.shutdown.shutdown();
            if slot.join.join().is_err() {
                tracing::warn!("IST sender thread for {} panicked", slot.peer);
            }
        }
    }

    fn reap_finished(&self) {
        let finished: Vec<SenderSlot> = {
            let mut senders = self.senders.lock().expect("sender map lock poisoned");
            let ids: Vec<u64> = senders
                .iter()
                .filter(|(_, slot)| slot.done.load(Ordering::Acquire))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| senders.remove(&id))
                .collect()
        };
        for slot in finished {
            if slot.join.join().is_err() {
                tracing::warn!("IST sender thread for {} panicked", slot.peer);
            }
        }
    }
}

impl<C: WriteSetCache + 'static> AsyncSenderMap<C> {
    /// Start an outbound session towards `peer`. Connection errors surface
    /// to the caller; streaming errors are recorded by the worker.
    pub fn run(
        &self,
        peer: &str,
        first: SeqNo,
        last: SeqNo,
        preload_start: SeqNo,
        version: u8,
    ) -> Result<(), IstError> {
        self.reap_finished();

        let mut sender = Sender::connect(&self.config, Arc::clone(&self.cache), peer, version)?;
        let shutdown = sender.shutdown_handle()?;
        let done = Arc::new(AtomicBool::new(false));

        let worker_done = Arc::clone(&done);
        let worker_peer = peer.to_string();
        let join = thread::Builder::new()
            .name("ist-sender".into())
            .spawn(move || {
                tracing::info!(
                    "async IST sender starting to serve {worker_peer} sending {first}-{last}, \
                     preload starts from {preload_start}"
                );
                match sender.send(first, last, preload_start) {
                    Ok(()) => {
                        tracing::info!("async IST sender served {worker_peer}, join seqno {last}");
                    }
                    Err(err) => {
                        tracing::error!("async IST sender failed to serve {worker_peer}: {err}");
                    }
                }
                worker_done.store(true, Ordering::Release);
            })
            .map_err(IstError::Transport)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders
            .lock()
            .expect("sender map lock poisoned")
            .insert(
                id,
                SenderSlot {
                    peer: peer.to_string(),
                    shutdown,
                    done,
                    join,
                },
            );
        Ok(())
    }
}

impl<C: WriteSetCache> Drop for AsyncSenderMap<C> {
    fn drop(&mut self) {
        self.cancel();
    }
}
