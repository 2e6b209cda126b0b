//! IST wire protocol: framing, handshake, control and ordered frames.
//!
//! Every frame starts with a one-byte tag and a big-endian u32 payload
//! length. Both sides must agree on the layout bit for bit; there is a
//! single encoder and a single decoder for each frame kind. The codec does
//! not checksum: write-set payloads carry an internal checksum validated by
//! the apply pipeline's unserializer.

use std::io::{Read, Write};

use bytes::Bytes;

use crate::action::{ActionKind, WriteSetAction};
use crate::cache::CacheBuffer;
use crate::error::IstError;
use crate::seqno::SeqNo;

/// Lowest protocol version this codec speaks.
pub const VERSION_MIN: u8 = 5;
/// Highest protocol version this codec speaks.
pub const VERSION_MAX: u8 = 10;
/// Ordered frames carry the preload flag from this version on.
pub(crate) const PRELOAD_MIN_VERSION: u8 = 7;

/// Upper bound on a single frame payload, rejected before allocation.
const MAX_FRAME_BYTES: usize = 1 << 30;

const FRAME_CTRL: u8 = 1;
const FRAME_ORDERED: u8 = 2;
const FRAME_HANDSHAKE: u8 = 3;
const FRAME_HANDSHAKE_RESPONSE: u8 = 4;

/// Control code sent when the proposed protocol version is unsupported.
pub(crate) const CTRL_ERR_VERSION: i32 = -1;

/// Single-frame control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ctrl {
    Ok,
    Eof,
    Err(i32),
}

impl Ctrl {
    fn code(self) -> i32 {
        match self {
            Ctrl::Ok => 0,
            Ctrl::Eof => 1,
            Ctrl::Err(code) => code,
        }
    }

    fn from_code(code: i32) -> Result<Self, IstError> {
        match code {
            0 => Ok(Ctrl::Ok),
            1 => Ok(Ctrl::Eof),
            code if code < 0 => Ok(Ctrl::Err(code)),
            code => Err(IstError::Protocol(format!("unknown control code {code}"))),
        }
    }
}

/// What arrived in place of a handshake response: either the agreed
/// version, or the abbreviated `C_EOF` shutdown injected by the control
/// thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeReply {
    Version(u8),
    Eof,
}

/// Donor-side half of version negotiation: accept the highest commonly
/// supported version, reject proposals below the floor.
pub(crate) fn negotiate(proposed: u8, local: u8) -> Result<u8, IstError> {
    if proposed < VERSION_MIN {
        return Err(IstError::Version {
            proposed,
            min: VERSION_MIN,
            max: VERSION_MAX,
        });
    }
    Ok(proposed.min(local).min(VERSION_MAX))
}

/// Frame codec for one IST session, parameterized by the negotiated
/// protocol version and the keep-keys flag handed to the write-set codec.
pub struct Proto {
    version: u8,
    keep_keys: bool,
}

impl Proto {
    pub fn new(version: u8, keep_keys: bool) -> Self {
        Self { version, keep_keys }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn keep_keys(&self) -> bool {
        self.keep_keys
    }

    /// Adopt the version agreed during the handshake.
    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn send_handshake<S: Write>(&self, stream: &mut S) -> Result<(), IstError> {
        write_frame(stream, FRAME_HANDSHAKE, &[self.version])
    }

    pub fn recv_handshake<S: Read>(&self, stream: &mut S) -> Result<u8, IstError> {
        let (tag, payload) = read_frame(stream)?;
        if tag != FRAME_HANDSHAKE {
            return Err(IstError::Protocol(format!(
                "expected handshake frame, got tag {tag}"
            )));
        }
        let &[version] = &payload[..] else {
            return Err(IstError::Protocol(format!(
                "handshake payload of {} bytes",
                payload.len()
            )));
        };
        Ok(version)
    }

    pub fn send_handshake_response<S: Write>(&self, stream: &mut S) -> Result<(), IstError> {
        write_frame(stream, FRAME_HANDSHAKE_RESPONSE, &[self.version])
    }

    /// Read the handshake response, or the ctrl `C_EOF` the control thread
    /// injects over a loopback connection for an abbreviated shutdown.
    pub fn recv_handshake_response<S: Read>(
        &self,
        stream: &mut S,
    ) -> Result<HandshakeReply, IstError> {
        let (tag, payload) = read_frame(stream)?;
        match tag {
            FRAME_HANDSHAKE_RESPONSE => {
                let &[version] = &payload[..] else {
                    return Err(IstError::Protocol(format!(
                        "handshake response payload of {} bytes",
                        payload.len()
                    )));
                };
                Ok(HandshakeReply::Version(version))
            }
            FRAME_CTRL => match parse_ctrl(&payload)? {
                Ctrl::Eof => Ok(HandshakeReply::Eof),
                Ctrl::Err(code) => Err(IstError::PeerError(code)),
                Ctrl::Ok => Err(IstError::Protocol(
                    "unexpected C_OK in place of handshake response".into(),
                )),
            },
            tag => Err(IstError::Protocol(format!(
                "expected handshake response, got tag {tag}"
            ))),
        }
    }

    pub fn send_ctrl<S: Write>(&self, stream: &mut S, ctrl: Ctrl) -> Result<(), IstError> {
        write_frame(stream, FRAME_CTRL, &ctrl.code().to_be_bytes())
    }

    pub fn recv_ctrl<S: Read>(&self, stream: &mut S) -> Result<Ctrl, IstError> {
        let (tag, payload) = read_frame(stream)?;
        if tag != FRAME_CTRL {
            return Err(IstError::Protocol(format!(
                "expected control frame, got tag {tag}"
            )));
        }
        parse_ctrl(&payload)
    }

    /// Write one ordered frame from a cache buffer.
    pub fn send_ordered<S: Write>(
        &self,
        stream: &mut S,
        buf: &CacheBuffer,
        preload: bool,
    ) -> Result<(), IstError> {
        let kind = buf.kind.wire_tag().ok_or_else(|| {
            IstError::Protocol(format!("cache buffer {} has no wire kind", buf.seqno_g))
        })?;

        let mut payload = Vec::with_capacity(10 + buf.data.len());
        payload.push(kind);
        if self.version >= PRELOAD_MIN_VERSION {
            payload.push(preload as u8);
        }
        payload.extend_from_slice(&buf.seqno_g.get().to_be_bytes());
        payload.extend_from_slice(&buf.data);
        write_frame(stream, FRAME_ORDERED, &payload)
    }

    /// Read one ordered frame. A ctrl `C_EOF` in its place maps to the
    /// application-layer EOF action.
    pub fn recv_ordered<S: Read>(
        &self,
        stream: &mut S,
    ) -> Result<(WriteSetAction, bool), IstError> {
        let (tag, payload) = read_frame(stream)?;
        match tag {
            FRAME_CTRL => match parse_ctrl(&payload)? {
                Ctrl::Eof => Ok((WriteSetAction::eof(), false)),
                Ctrl::Err(code) => Err(IstError::PeerError(code)),
                Ctrl::Ok => Err(IstError::Protocol(
                    "unexpected C_OK in ordered stream".into(),
                )),
            },
            FRAME_ORDERED => self.parse_ordered(payload),
            tag => Err(IstError::Protocol(format!(
                "unexpected frame tag {tag} in ordered stream"
            ))),
        }
    }

    fn parse_ordered(&self, payload: Vec<u8>) -> Result<(WriteSetAction, bool), IstError> {
        let header_len = if self.version >= PRELOAD_MIN_VERSION {
            10
        } else {
            9
        };
        if payload.len() < header_len {
            return Err(IstError::Protocol(format!(
                "short ordered frame header: {} bytes",
                payload.len()
            )));
        }

        let kind = ActionKind::from_wire_tag(payload[0]).ok_or_else(|| {
            IstError::Protocol(format!("unknown action type {}", payload[0]))
        })?;
        let preload = if self.version >= PRELOAD_MIN_VERSION {
            match payload[1] {
                0 => false,
                1 => true,
                byte => {
                    return Err(IstError::Protocol(format!("invalid preload flag {byte}")));
                }
            }
        } else {
            false
        };
        let seqno_bytes: [u8; 8] = payload[header_len - 8..header_len]
            .try_into()
            .expect("seqno slice is eight bytes");
        let seqno_g = SeqNo::new(i64::from_be_bytes(seqno_bytes));
        if seqno_g.get() <= 0 {
            return Err(IstError::Protocol(format!(
                "non-positive seqno {seqno_g} in ordered frame"
            )));
        }

        let mut payload = Bytes::from(payload);
        let buf = payload.split_off(header_len);
        Ok((
            WriteSetAction {
                seqno_g,
                kind,
                buf,
            },
            preload,
        ))
    }

    /// Send `C_EOF`, then drain the stream until the peer closes it so the
    /// close is observed as a graceful FIN rather than a reset. Stray bytes
    /// are logged and dropped.
    pub fn send_eof<S: Read + Write>(&self, stream: &mut S) -> Result<(), IstError> {
        self.send_ctrl(stream, Ctrl::Eof)?;

        let mut drain = [0u8; 64];
        loop {
            match stream.read(&mut drain) {
                Ok(0) => return Ok(()),
                Ok(n) => tracing::warn!("received {n} bytes during EOF drain, expected none"),
                Err(err) => {
                    // The peer aborted instead of closing; treated the same.
                    tracing::debug!("EOF drain ended with error: {err}");
                    return Ok(());
                }
            }
        }
    }
}

fn parse_ctrl(payload: &[u8]) -> Result<Ctrl, IstError> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| {
        IstError::Protocol(format!("control payload of {} bytes", payload.len()))
    })?;
    Ctrl::from_code(i32::from_be_bytes(bytes))
}

fn write_frame<S: Write>(stream: &mut S, tag: u8, payload: &[u8]) -> Result<(), IstError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| IstError::Protocol(format!("frame payload of {} bytes", payload.len())))?;
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(tag);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

fn read_frame<S: Read>(stream: &mut S) -> Result<(u8, Vec<u8>), IstError> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let tag = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(IstError::Protocol(format!("frame payload of {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            IstError::Protocol("truncated frame payload".into())
        } else {
            IstError::Transport(err)
        }
    })?;
    Ok((tag, payload))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::Bytes;

    use super::{Ctrl, HandshakeReply, Proto, VERSION_MAX, VERSION_MIN, negotiate};
    use crate::action::ActionKind;
    use crate::cache::CacheBuffer;
    use crate::error::IstError;
    use crate::seqno::SeqNo;

    fn buf(seqno: i64, data: &[u8]) -> CacheBuffer {
        CacheBuffer {
            seqno_g: SeqNo::new(seqno),
            kind: ActionKind::WriteSet,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn handshake_round_trip() {
        let proto = Proto::new(9, true);
        let mut wire = Vec::new();
        proto.send_handshake(&mut wire).unwrap();
        assert_eq!(proto.recv_handshake(&mut Cursor::new(wire)).unwrap(), 9);
    }

    #[test]
    fn handshake_response_round_trip() {
        let proto = Proto::new(8, true);
        let mut wire = Vec::new();
        proto.send_handshake_response(&mut wire).unwrap();
        assert_eq!(
            proto
                .recv_handshake_response(&mut Cursor::new(wire))
                .unwrap(),
            HandshakeReply::Version(8)
        );
    }

    #[test]
    fn eof_in_place_of_handshake_response() {
        let proto = Proto::new(8, true);
        let mut wire = Vec::new();
        proto.send_ctrl(&mut wire, Ctrl::Eof).unwrap();
        assert_eq!(
            proto
                .recv_handshake_response(&mut Cursor::new(wire))
                .unwrap(),
            HandshakeReply::Eof
        );
    }

    #[test]
    fn ctrl_round_trip_including_errors() {
        let proto = Proto::new(8, true);
        for ctrl in [Ctrl::Ok, Ctrl::Eof, Ctrl::Err(-42)] {
            let mut wire = Vec::new();
            proto.send_ctrl(&mut wire, ctrl).unwrap();
            assert_eq!(proto.recv_ctrl(&mut Cursor::new(wire)).unwrap(), ctrl);
        }
    }

    #[test]
    fn ordered_round_trip_with_preload() {
        let proto = Proto::new(7, true);
        let mut wire = Vec::new();
        proto
            .send_ordered(&mut wire, &buf(42, b"payload"), true)
            .unwrap();

        let (action, preload) = proto.recv_ordered(&mut Cursor::new(wire)).unwrap();
        assert_eq!(action.seqno_g, SeqNo::new(42));
        assert_eq!(action.kind, ActionKind::WriteSet);
        assert_eq!(&action.buf[..], b"payload");
        assert!(preload);
    }

    #[test]
    fn ordered_frame_has_no_preload_byte_below_version_seven() {
        let old = Proto::new(6, true);
        let new = Proto::new(7, true);

        let mut old_wire = Vec::new();
        old.send_ordered(&mut old_wire, &buf(1, b"x"), true).unwrap();
        let mut new_wire = Vec::new();
        new.send_ordered(&mut new_wire, &buf(1, b"x"), true).unwrap();
        assert_eq!(old_wire.len() + 1, new_wire.len());

        // The flag decodes as false no matter what the donor passed.
        let (action, preload) = old.recv_ordered(&mut Cursor::new(old_wire)).unwrap();
        assert_eq!(action.seqno_g, SeqNo::new(1));
        assert!(!preload);
    }

    #[test]
    fn ctrl_eof_maps_to_application_eof() {
        let proto = Proto::new(8, true);
        let mut wire = Vec::new();
        proto.send_ctrl(&mut wire, Ctrl::Eof).unwrap();
        let (action, preload) = proto.recv_ordered(&mut Cursor::new(wire)).unwrap();
        assert!(action.is_eof());
        assert!(!preload);
    }

    #[test]
    fn negative_ctrl_surfaces_as_peer_error() {
        let proto = Proto::new(8, true);
        let mut wire = Vec::new();
        proto.send_ctrl(&mut wire, Ctrl::Err(-7)).unwrap();
        assert!(matches!(
            proto.recv_ordered(&mut Cursor::new(wire)),
            Err(IstError::PeerError(-7))
        ));
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let proto = Proto::new(8, true);
        let mut wire = Vec::new();
        proto
            .send_ordered(&mut wire, &buf(42, b"payload"), false)
            .unwrap();
        wire.truncate(wire.len() - 3);
        assert!(matches!(
            proto.recv_ordered(&mut Cursor::new(wire)),
            Err(IstError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let proto = Proto::new(8, true);
        let mut wire = vec![super::FRAME_ORDERED];
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            proto.recv_ordered(&mut Cursor::new(wire)),
            Err(IstError::Protocol(_))
        ));
    }

    #[test]
    fn negotiation_clamps_and_rejects() {
        assert_eq!(negotiate(VERSION_MAX, VERSION_MAX).unwrap(), VERSION_MAX);
        assert_eq!(negotiate(200, VERSION_MAX).unwrap(), VERSION_MAX);
        assert_eq!(negotiate(9, 8).unwrap(), 8);
        assert!(matches!(
            negotiate(VERSION_MIN - 1, VERSION_MAX),
            Err(IstError::Version { .. })
        ));
    }
}
