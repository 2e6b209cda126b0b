//! IST receiver: listener, SST rendezvous, ordered apply dispatch.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver as SignalReceiver, Sender as SignalSender, bounded};
use uuid::Uuid;

use crate::action::ActionKind;
use crate::cache::WriteSetCache;
use crate::config::{IstConfig, ResolvedAddr, resolve_recv_addr, resolve_recv_bind};
use crate::error::IstError;
use crate::handler::EventHandler;
use crate::progress::Progress;
use crate::proto::{Ctrl, HandshakeReply, Proto, VERSION_MAX, VERSION_MIN};
use crate::seqno::SeqNo;
use crate::stream::{IstListener, IstStream};

/// Signal resolving the SST-to-IST rendezvous.
#[derive(Clone, Copy, Debug)]
enum SstSignal {
    Ready(SeqNo),
    Interrupted,
}

/// State shared between the control thread and the receive thread.
struct ReceiverShared {
    current_seqno: AtomicI64,
    running: AtomicBool,
    error: Mutex<Option<IstError>>,
    signal: Mutex<Option<SignalSender<SstSignal>>>,
}

impl ReceiverShared {
    fn new() -> Self {
        Self {
            current_seqno: AtomicI64::new(SeqNo::UNDEFINED.get()),
            running: AtomicBool::new(false),
            error: Mutex::new(None),
            signal: Mutex::new(None),
        }
    }

    fn take_signal(&self) -> Option<SignalSender<SstSignal>> {
        self.signal.lock().expect("receiver signal lock poisoned").take()
    }
}

/// Joiner-side IST engine.
///
/// `prepare` binds the listener and spawns the receive thread, which owns
/// the listener, the apply handler, and its half of the SST rendezvous by
/// value. `ready` resolves the rendezvous once SST has installed a state;
/// `finished` terminates the session and joins the thread.
pub struct Receiver<C, H> {
    config: IstConfig,
    cache: Arc<C>,
    handler: Option<H>,
    shared: Arc<ReceiverShared>,
    join: Option<JoinHandle<()>>,
    recv_addr: Option<ResolvedAddr>,
    version: u8,
    source_id: Uuid,
}

impl<C, H> Receiver<C, H>
where
    C: WriteSetCache + 'static,
    H: EventHandler + 'static,
{
    pub fn new(config: IstConfig, cache: Arc<C>, handler: H) -> Self {
        Self {
            config,
            cache,
            handler: Some(handler),
            shared: Arc::new(ReceiverShared::new()),
            join: None,
            recv_addr: None,
            version: 0,
            source_id: Uuid::nil(),
        }
    }

    /// Bind the listener, spawn the receive thread, and return the
    /// advertisable receive address (with the OS-assigned port substituted
    /// when port 0 was requested).
    pub fn prepare(
        &mut self,
        first: SeqNo,
        last: SeqNo,
        version: u8,
        source_id: Uuid,
    ) -> Result<String, IstError> {
        if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
            return Err(IstError::Version {
                proposed: version,
                min: VERSION_MIN,
                max: VERSION_MAX,
            });
        }
        if self.join.is_some() {
            return Err(IstError::Config("IST receiver already prepared".into()));
        }
        if self.handler.is_none() {
            return Err(IstError::Config("IST receiver session already consumed".into()));
        }

        let advert = resolve_recv_addr(&self.config)?;
        let bind = resolve_recv_bind(&self.config)?;
        let listener = IstListener::bind(&bind, self.config.tls.as_ref(), version)?;
        let advert = advert.with_port(listener.local_port()?);
        let handler = self.handler.take().expect("handler presence checked above");

        let (signal_tx, signal_rx) = bounded(1);
        self.shared
            .current_seqno
            .store(SeqNo::UNDEFINED.get(), Ordering::Release);
        *self.shared.error.lock().expect("receiver error lock poisoned") = None;
        *self.shared.signal.lock().expect("receiver signal lock poisoned") = Some(signal_tx);
        self.shared.running.store(true, Ordering::Release);
        self.version = version;
        self.source_id = source_id;

        let task = ReceiveTask {
            listener: Some(listener),
            proto: Proto::new(version, self.config.keep_keys),
            first,
            last,
            cache: Arc::clone(&self.cache),
            handler,
            shared: Arc::clone(&self.shared),
            rendezvous: signal_rx,
        };
        let join = thread::Builder::new()
            .name("ist-receiver".into())
            .spawn(move || task.run())
            .map_err(IstError::Transport)?;
        self.join = Some(join);
        self.recv_addr = Some(advert.clone());

        tracing::info!(
            source = %self.source_id,
            "prepared IST receiver for {first}-{last}, listening at: {advert}"
        );
        Ok(advert.to_string())
    }

    /// Signal that SST has completed and applying must start at `first`.
    /// Callers invoke this at most once per session.
    pub fn ready(&self, first: SeqNo) {
        assert!(first.get() > 0, "ready() called with non-positive seqno");
        if let Some(signal) = self.shared.take_signal() {
            let _ = signal.send(SstSignal::Ready(first));
        }
    }

    /// Terminate the session and join the receive thread. Returns the last
    /// seqno the stream reached.
    pub fn finished(&mut self) -> SeqNo {
        let Some(addr) = self.recv_addr.take() else {
            tracing::debug!("IST was not prepared before calling finished()");
            return self.current_seqno();
        };

        self.interrupt(&addr);
        if let Some(signal) = self.shared.take_signal() {
            let _ = signal.send(SstSignal::Interrupted);
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("IST receiver thread panicked");
            }
        }
        self.shared.running.store(false, Ordering::Release);
        self.current_seqno()
    }

    /// Last seqno the receive thread has validated.
    pub fn current_seqno(&self) -> SeqNo {
        SeqNo::new(self.shared.current_seqno.load(Ordering::Acquire))
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Take the persistent session error, if any. Cancellation is never
    /// recorded here.
    pub fn take_error(&self) -> Option<IstError> {
        self.shared.error.lock().expect("receiver error lock poisoned").take()
    }

    /// Abbreviated shutdown handshake over a loopback connection, so a
    /// receive thread blocked in `accept` observes a clean `C_EOF` from its
    /// own listener. Failures are ignored; the thread may be past the point
    /// where this can reach it.
    fn interrupt(&self, addr: &ResolvedAddr) {
        let attempt = || -> Result<(), IstError> {
            let mut stream = IstStream::connect(addr, self.config.tls.as_ref())?;
            let proto = Proto::new(self.version, self.config.keep_keys);
            proto.recv_handshake(&mut stream)?;
            proto.send_ctrl(&mut stream, Ctrl::Eof)?;
            let _ = proto.recv_ctrl(&mut stream);
            Ok(())
        };
        if let Err(err) = attempt() {
            tracing::debug!("IST interrupt connection failed: {err}");
        }
    }
}

struct ReceiveTask<C, H> {
    listener: Option<IstListener>,
    proto: Proto,
    first: SeqNo,
    last: SeqNo,
    cache: Arc<C>,
    handler: H,
    shared: Arc<ReceiverShared>,
    rendezvous: SignalReceiver<SstSignal>,
}

impl<C, H> ReceiveTask<C, H>
where
    C: WriteSetCache,
    H: EventHandler,
{
    fn run(mut self) {
        let result = self.session();
        self.cache.seqno_unlock();

        let current = SeqNo::new(self.shared.current_seqno.load(Ordering::Acquire));
        let result = match result {
            // A cleanly ended but short stream is a protocol violation;
            // failures before that keep their own identity.
            Ok(()) if self.last.get() > 0 && current < self.last => {
                tracing::error!(
                    "IST didn't contain all write sets, expected last: {} last received: {}",
                    self.last,
                    current
                );
                Err(IstError::Truncated {
                    current,
                    last: self.last,
                })
            }
            other => other,
        };

        self.shared.running.store(false, Ordering::Release);
        match result {
            Ok(()) => self.handler.ist_end(Ok(())),
            Err(err) => {
                if !matches!(err, IstError::Interrupted) {
                    tracing::error!("IST receive failed: {err}");
                }
                self.handler.ist_end(Err(&err));
                if err.is_recordable() {
                    *self.shared.error.lock().expect("receiver error lock poisoned") = Some(err);
                }
            }
        }
    }

    fn session(&mut self) -> Result<(), IstError> {
        let listener = self.listener.take().expect("receive task runs once");
        let mut stream = listener.accept()?;
        // One connection only; release the listen port before streaming.
        drop(listener);

        self.proto.send_handshake(&mut stream)?;
        match self.proto.recv_handshake_response(&mut stream)? {
            HandshakeReply::Version(agreed) => {
                if agreed < VERSION_MIN || agreed > self.proto.version() {
                    return Err(IstError::Protocol(format!(
                        "donor agreed on unusable version {agreed}"
                    )));
                }
                self.proto.set_version(agreed);
            }
            HandshakeReply::Eof => return Err(IstError::Interrupted),
        }
        self.proto.send_ctrl(&mut stream, Ctrl::Ok)?;

        match self.rendezvous.recv() {
            Ok(SstSignal::Ready(first)) => self.first = first,
            Ok(SstSignal::Interrupted) | Err(_) => {
                tracing::info!("IST receive interrupted before SST completion");
                return Err(IstError::Interrupted);
            }
        }
        tracing::info!("IST applying starts with {}", self.first);
        debug_assert!(self.first.get() > 0);

        let mut progress: Option<Progress> = None;
        let mut preload_started = false;

        loop {
            let (action, preload) = self.proto.recv_ordered(&mut stream)?;
            if action.is_eof() {
                tracing::debug!("eof received, closing socket");
                break;
            }

            let mut current = SeqNo::new(self.shared.current_seqno.load(Ordering::Acquire));
            if current.is_undefined() {
                if action.seqno_g > self.first {
                    tracing::error!(
                        "IST started with wrong seqno: {}, expected <= {}",
                        action.seqno_g,
                        self.first
                    );
                    return Err(IstError::StartSeqno {
                        got: action.seqno_g,
                        first: self.first,
                    });
                }
                current = action.seqno_g;
                tracing::info!("IST current seqno initialized to {current}");
                progress = Some(Progress::new(
                    "receiving IST",
                    "events",
                    (self.last.get() - current.get() + 1).max(0),
                    16,
                ));
            } else {
                current = current.next();
                if let Some(progress) = progress.as_mut() {
                    progress.update(1);
                }
            }
            self.shared
                .current_seqno
                .store(current.get(), Ordering::Release);

            if action.seqno_g != current {
                tracing::error!(
                    "unexpected action seqno: {} expected: {current}",
                    action.seqno_g
                );
                return Err(IstError::SeqnoMismatch {
                    got: action.seqno_g,
                    expected: current,
                });
            }

            let must_apply = current >= self.first;
            if preload && !preload_started {
                tracing::info!("IST preload starting at {current}");
                preload_started = true;
            }

            match action.kind {
                ActionKind::WriteSet => {
                    let trx = self
                        .handler
                        .unserialize(&action, self.proto.keep_keys())?;
                    self.handler.ist_trx(trx, must_apply, preload)?;
                }
                ActionKind::Cchange => {
                    tracing::info!(
                        "passing IST CC {current}, must_apply: {must_apply}, preload: {preload}"
                    );
                    self.handler.ist_cc(action, must_apply, preload)?;
                }
                ActionKind::Unknown => unreachable!("eof handled above"),
            }
        }

        if let Some(progress) = progress {
            progress.finish();
        }
        Ok(())
    }
}
