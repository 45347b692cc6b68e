//! Per-connection framing engine.
//!
//! One instance per connection, driven single-threaded by that connection's
//! reader. Accumulates transport chunks, auto-detects the protocol on the
//! first packet, latches it for the life of the connection, and yields whole
//! packets. `NotEnoughData` preserves the cursor; `BadSchema` while bound and
//! `TooBigData` always are terminal for the connection.

use crate::proto::{codec_of, detect_candidates, ConnRole, ConnState, ProtocolId, RawPacket};
use bytes::Bytes;
use polyrpc_core::error::DecodeError;
use polyrpc_core::BufferStore;

/// One decoded packet plus the protocol that produced it.
#[derive(Debug)]
pub struct Framed {
    pub protocol: ProtocolId,
    pub packet: RawPacket,
}

enum Binding {
    Unbound,
    Bound(ProtocolId),
    Fatal(DecodeError),
}

pub struct FramingEngine {
    acc: BufferStore,
    conn: ConnState,
    binding: Binding,
}

impl FramingEngine {
    pub fn new(role: ConnRole) -> Self {
        Self { acc: BufferStore::new(), conn: ConnState::new(role), binding: Binding::Unbound }
    }

    /// An engine latched up front; clients know the protocol they dialed.
    pub fn new_bound(role: ConnRole, id: ProtocolId) -> Self {
        Self {
            acc: BufferStore::new(),
            conn: ConnState::new(role),
            binding: Binding::Bound(id),
        }
    }

    #[inline]
    pub fn bound_protocol(&self) -> Option<ProtocolId> {
        match self.binding {
            Binding::Bound(id) => Some(id),
            _ => None,
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self.binding, Binding::Fatal(_))
    }

    /// Protocol connection state, shared with encode paths that need it.
    #[inline]
    pub fn conn(&mut self) -> &mut ConnState {
        &mut self.conn
    }

    /// Control frames a stateful protocol owes the peer (HTTP/2 settings,
    /// acks, pongs); the connection writer drains this after every feed.
    pub fn take_control(&mut self) -> Option<Bytes> {
        self.conn.h2.as_mut().and_then(|h2| h2.take_control())
    }

    /// Append one transport chunk and decode every whole packet it
    /// completes. A fatal error poisons the engine; packets decoded before
    /// the poison point are still delivered, and the caller must check
    /// [is_fatal](Self::is_fatal) after processing them, close the
    /// connection, and cancel its in-flight requests.
    pub fn feed(&mut self, chunk: Bytes) -> Result<Vec<Framed>, DecodeError> {
        if let Binding::Fatal(e) = self.binding {
            return Err(e);
        }
        self.acc.append(chunk);
        let mut out = Vec::new();
        loop {
            match self.binding {
                Binding::Bound(id) => {
                    let codec = codec_of(id);
                    match codec.decode(&mut self.acc, &mut self.conn) {
                        Ok(packet) => out.push(Framed { protocol: id, packet }),
                        Err(DecodeError::NotEnoughData) => return Ok(out),
                        Err(e) => {
                            warn!("connection fatal on bound protocol {:?}: {}", id, e);
                            self.binding = Binding::Fatal(e);
                            return self.poisoned(out, e);
                        }
                    }
                }
                Binding::Unbound => {
                    if self.acc.is_empty() {
                        return Ok(out);
                    }
                    match self.detect() {
                        Ok(Some(framed)) => {
                            self.binding = Binding::Bound(framed.protocol);
                            debug!("connection bound to {:?}", framed.protocol);
                            out.push(framed);
                        }
                        Ok(None) => {
                            // a codec may latch mid-decode before the first
                            // whole packet exists (gRPC at the preface)
                            if let Some(id) = self.conn.bound_hint.take() {
                                self.binding = Binding::Bound(id);
                                debug!("connection bound to {:?} by prefix", id);
                                continue;
                            }
                            return Ok(out);
                        }
                        Err(e) => {
                            self.binding = Binding::Fatal(e);
                            return self.poisoned(out, e);
                        }
                    }
                }
                Binding::Fatal(e) => return self.poisoned(out, e),
            }
        }
    }

    /// Packets decoded before the poison point still go out; the error
    /// itself surfaces immediately only when there is nothing to deliver.
    fn poisoned(&self, out: Vec<Framed>, e: DecodeError) -> Result<Vec<Framed>, DecodeError> {
        if out.is_empty() {
            Err(e)
        } else {
            Ok(out)
        }
    }

    /// Try each candidate codec against the accumulator in order. Returns
    /// `Ok(None)` when the winner is still short on bytes.
    fn detect(&mut self) -> Result<Option<Framed>, DecodeError> {
        for codec in detect_candidates() {
            match codec.decode(&mut self.acc, &mut self.conn) {
                Ok(packet) => return Ok(Some(Framed { protocol: codec.id(), packet })),
                Err(DecodeError::NotEnoughData) => return Ok(None),
                Err(DecodeError::BadSchema) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!("no protocol recognises the connection prefix");
        Err(DecodeError::BadSchema)
    }
}
