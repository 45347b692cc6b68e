//! Server-push sub-header protocol.
//!
//! A 24-byte little-endian [SpHead] rides in front of an ordinary
//! length-prefixed packet and carries a `type` word distinguishing normal
//! calls from server-originated ones; the dispatch adapter routes push
//! requests to client-side handlers instead of server-side methods.

use super::*;
use bytes::Bytes;
use polyrpc_core::error::{DecodeError, RpcError};
use polyrpc_core::{BufferStore, MAX_BODY_SIZE};
use std::mem::size_of;
use zerocopy::byteorder::{LE, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const SPHEAD_MAGIC: u32 = 0xfb70_9394;
pub const SPHEAD_LEN: usize = size_of::<SpHeadWire>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SpType {
    Request = 0,
    Response = 1,
    PushRequest = 2,
    PushResponse = 3,
}

impl SpType {
    #[inline]
    pub fn from_wire(v: u32) -> Result<Self, RpcError> {
        match v {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::PushRequest),
            3 => Ok(Self::PushResponse),
            _ => Err(RpcError::serialization(format!("unknown sp-head type {}", v))),
        }
    }

    /// Whether the packet travels in the request direction.
    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request | Self::PushRequest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpHead {
    pub id: u16,
    pub version: u16,
    pub log_id: u64,
    pub typ: SpType,
}

impl SpHead {
    #[inline]
    pub fn new(typ: SpType, log_id: u64) -> Self {
        Self { id: 0, version: 1, log_id, typ }
    }
}

/// | 2B | 2B      | 8B     | 4B        | 4B   | 4B       |
/// | id | version | log_id | magic_num | type | body_len |
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy)]
#[repr(packed)]
struct SpHeadWire {
    id: U16<LE>,
    version: U16<LE>,
    log_id: U64<LE>,
    magic_num: U32<LE>,
    typ: U32<LE>,
    body_len: U32<LE>,
}

/// Wraps a length-prefixed codec; the inner packet is exactly `body_len`
/// bytes after the sub-header.
pub struct ServerPushCodec {
    inner: &'static dyn ProtocolCodec,
}

pub static SERVER_PUSH_CODEC: ServerPushCodec =
    ServerPushCodec { inner: &super::baidu::BaiduStdCodec };

impl ServerPushCodec {
    fn head_of(raw: &RawPacket) -> Option<SpHead> {
        match raw {
            RawPacket::Push { head, .. } => Some(*head),
            _ => None,
        }
    }
}

impl ProtocolCodec for ServerPushCodec {
    #[inline]
    fn id(&self) -> ProtocolId {
        ProtocolId::ServerPush
    }

    fn decode(
        &self, acc: &mut BufferStore, conn: &mut ConnState,
    ) -> Result<RawPacket, DecodeError> {
        let mut head_buf = [0u8; SPHEAD_LEN];
        acc.peek_into(&mut head_buf)?;
        let wire = SpHeadWire::read_from(&head_buf[..]).ok_or(DecodeError::BadSchema)?;
        if wire.magic_num.get() != SPHEAD_MAGIC {
            return Err(DecodeError::BadSchema);
        }
        let typ = SpType::from_wire(wire.typ.get()).map_err(|_| DecodeError::BadSchema)?;
        let body_len = wire.body_len.get() as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(DecodeError::TooBigData);
        }
        if acc.readable() < SPHEAD_LEN + body_len {
            return Err(DecodeError::NotEnoughData);
        }
        // decode the wrapped packet from a non-consuming slice first: the
        // cursor moves only once the whole thing parsed
        let inner_bytes = acc.retained_slice(SPHEAD_LEN, body_len)?;
        let mut inner_acc = BufferStore::new();
        inner_acc.append(inner_bytes);
        let inner = match self.inner.decode(&mut inner_acc, conn) {
            Ok(inner) => inner,
            // body_len promised a whole packet; a short inner read is a lie
            Err(DecodeError::NotEnoughData) => return Err(DecodeError::BadSchema),
            Err(e) => return Err(e),
        };
        if !inner_acc.is_empty() {
            warn!("sp-head body_len {} exceeds the inner packet", body_len);
            return Err(DecodeError::BadSchema);
        }
        acc.skip(SPHEAD_LEN + body_len)?;
        let head = SpHead {
            id: wire.id.get(),
            version: wire.version.get(),
            log_id: wire.log_id.get(),
            typ,
        };
        Ok(RawPacket::Push { head, inner: Box::new(inner) })
    }

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError> {
        let head = Self::head_of(&raw)
            .ok_or_else(|| RpcError::serialization("server-push expects an sp-head packet"))?;
        if !head.typ.is_request() {
            return Err(RpcError::serialization("sp-head response packet on the request path"));
        }
        let RawPacket::Push { inner, .. } = raw else { unreachable!() };
        self.inner.decode_request(*inner, req)?;
        req.sp_head = Some(head);
        Ok(())
    }

    fn decode_response(&self, raw: RawPacket, conn: &mut ConnState) -> Result<Response, RpcError> {
        let head = Self::head_of(&raw)
            .ok_or_else(|| RpcError::serialization("server-push expects an sp-head packet"))?;
        if head.typ.is_request() {
            return Err(RpcError::serialization("sp-head request packet on the response path"));
        }
        let RawPacket::Push { inner, .. } = raw else { unreachable!() };
        let mut resp = self.inner.decode_response(*inner, conn)?;
        resp.sp_head = Some(head);
        Ok(resp)
    }

    fn encode_request(&self, req: &mut Request, conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let head = req.sp_head.unwrap_or_else(|| SpHead::new(SpType::Request, req.log_id));
        let inner = self.inner.encode_request(req, conn)?;
        Ok(prepend_sp_head(&head, &inner))
    }

    fn encode_response(&self, resp: &Response, conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let head = resp.sp_head.unwrap_or_else(|| SpHead::new(SpType::Response, resp.log_id));
        let inner = self.inner.encode_response(resp, conn)?;
        Ok(prepend_sp_head(&head, &inner))
    }
}

fn prepend_sp_head(head: &SpHead, inner: &[u8]) -> Bytes {
    let wire = SpHeadWire {
        id: U16::new(head.id),
        version: U16::new(head.version),
        log_id: U64::new(head.log_id),
        magic_num: U32::new(SPHEAD_MAGIC),
        typ: U32::new(head.typ as u32),
        body_len: U32::new(inner.len() as u32),
    };
    let mut out = bytes::BytesMut::with_capacity(SPHEAD_LEN + inner.len());
    out.extend_from_slice(wire.as_bytes());
    out.extend_from_slice(inner);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_len() {
        assert_eq!(SPHEAD_LEN, 24);
    }

    #[test]
    fn test_push_request_roundtrip() {
        let mut req = Request {
            log_id: 21,
            service_name: "push.Notifier".to_string(),
            method: MethodKey::Name("Notify".to_string()),
            body: Bytes::from_static(b"\x0a\x01x"),
            sp_head: Some(SpHead::new(SpType::PushRequest, 21)),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Server);
        let buf = SERVER_PUSH_CODEC.encode_request(&mut req, &mut conn).expect("encode");
        // sub-header, then the wrapped packet's own magic
        assert_eq!(&buf[SPHEAD_LEN..SPHEAD_LEN + 4], b"PRPC");

        let mut acc = BufferStore::new();
        acc.append(buf);
        let raw = SERVER_PUSH_CODEC.decode(&mut acc, &mut conn).expect("decode");
        let mut back = Request::default();
        SERVER_PUSH_CODEC.decode_request(raw, &mut back).expect("decode_request");
        let head = back.sp_head.expect("sp head");
        assert_eq!(head.typ, SpType::PushRequest);
        assert_eq!(head.log_id, 21);
        assert_eq!(back.service_name, "push.Notifier");
    }

    #[test]
    fn test_direction_mismatch() {
        let mut req = Request {
            log_id: 4,
            service_name: "push.Notifier".to_string(),
            method: MethodKey::Name("Notify".to_string()),
            sp_head: Some(SpHead::new(SpType::PushRequest, 4)),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Server);
        let buf = SERVER_PUSH_CODEC.encode_request(&mut req, &mut conn).expect("encode");
        let mut acc = BufferStore::new();
        acc.append(buf);
        let raw = SERVER_PUSH_CODEC.decode(&mut acc, &mut conn).expect("decode");
        assert!(SERVER_PUSH_CODEC.decode_response(raw, &mut conn).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = vec![0u8; SPHEAD_LEN];
        buf[12..16].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        let mut acc = BufferStore::new();
        acc.append(Bytes::from(buf));
        let mut conn = ConnState::new(ConnRole::Server);
        assert_eq!(
            SERVER_PUSH_CODEC.decode(&mut acc, &mut conn).unwrap_err(),
            DecodeError::BadSchema
        );
    }
}
