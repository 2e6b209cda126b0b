//! Incremental state transfer (IST) for a multi-master replication cluster.
//!
//! When a joining node lags the cluster by a bounded range of write-sets
//! still present in a donor's write-set cache, IST streams that range over
//! a point-to-point TCP or TLS connection so the joiner catches up without
//! a full state snapshot (SST). The joiner runs a [`Receiver`]: it binds a
//! listener, waits for SST to install a base state, then consumes ordered
//! write-set frames and dispatches them to an [`EventHandler`]. The donor
//! runs a [`Sender`] (usually supervised by an [`AsyncSenderMap`]) that
//! reads the requested seqno range from a [`WriteSetCache`] and streams it
//! in strictly ascending order, closing with a mutual EOF drain.
//!
//! Every write-set's global seqno is delivered exactly once, in order,
//! with no gap and no duplicate; frames below the SST-installed seqno are
//! still delivered (with `must_apply = false`) so the joiner's local cache
//! stays contiguous.

pub mod action;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
mod progress;
pub mod proto;
pub mod receiver;
pub mod sender;
pub mod seqno;
mod stream;
mod tls;

pub use action::{ActionKind, WriteSetAction};
pub use cache::{CacheBuffer, InMemoryWriteSetCache, WriteSetCache};
pub use config::{IstConfig, TlsOptions};
pub use error::IstError;
pub use handler::{ApplyError, EventHandler};
pub use proto::{Ctrl, HandshakeReply, Proto, VERSION_MAX, VERSION_MIN};
pub use receiver::Receiver;
pub use sender::{AsyncSenderMap, Sender};
pub use seqno::SeqNo;
