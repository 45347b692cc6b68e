//! NSHead protocol: a fixed 36-byte little-endian head in front of the
//! message body. The wire carries no service or method name; an NSHead
//! connection is bound to the one method registered with [NsHeadInfo].

use super::*;
use bytes::Bytes;
use polyrpc_core::error::{DecodeError, RpcError};
use polyrpc_core::{BufferStore, MAX_BODY_SIZE};
use std::mem::size_of;
use zerocopy::byteorder::{LE, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const NSHEAD_MAGIC: u32 = 0xfb70_9394;
pub const NSHEAD_LEN: usize = size_of::<NsHead>();

/// Head layout:
/// | 2B | 2B      | 4B     | 16B      | 4B        | 4B       | 4B       |
/// | id | version | log_id | provider | magic_num | reserved | body_len |
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy)]
#[repr(packed)]
pub struct NsHead {
    pub id: U16<LE>,
    pub version: U16<LE>,
    pub log_id: U32<LE>,
    pub provider: [u8; 16],
    pub magic_num: U32<LE>,
    pub reserved: U32<LE>,
    pub body_len: U32<LE>,
}

pub struct NsHeadCodec;

impl ProtocolCodec for NsHeadCodec {
    #[inline]
    fn id(&self) -> ProtocolId {
        ProtocolId::NsHead
    }

    fn decode(
        &self, acc: &mut BufferStore, _conn: &mut ConnState,
    ) -> Result<RawPacket, DecodeError> {
        let mut head_buf = [0u8; NSHEAD_LEN];
        acc.peek_into(&mut head_buf)?;
        let head = NsHead::read_from(&head_buf[..]).ok_or(DecodeError::BadSchema)?;
        if head.magic_num.get() != NSHEAD_MAGIC {
            return Err(DecodeError::BadSchema);
        }
        let body_len = head.body_len.get() as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(DecodeError::TooBigData);
        }
        if acc.readable() < NSHEAD_LEN + body_len {
            return Err(DecodeError::NotEnoughData);
        }
        let meta = acc.read_retained_slice(NSHEAD_LEN)?;
        let body = acc.read_retained_slice(body_len)?;
        Ok(RawPacket::Framed { meta, body })
    }

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("nshead expects a framed packet"));
        };
        let head = NsHead::read_from(&meta[..])
            .ok_or_else(|| RpcError::serialization("nshead head short"))?;
        req.log_id = head.log_id.get() as u64;
        req.ns_head = Some(NsHeadInfo {
            id: head.id.get(),
            version: head.version.get(),
            provider: head.provider,
        });
        // method resolution comes from the registry's nshead binding
        req.body = body;
        Ok(())
    }

    fn decode_response(&self, raw: RawPacket, _conn: &mut ConnState) -> Result<Response, RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("nshead expects a framed packet"));
        };
        let head = NsHead::read_from(&meta[..])
            .ok_or_else(|| RpcError::serialization("nshead head short"))?;
        Ok(Response { log_id: head.log_id.get() as u64, body, ..Default::default() })
    }

    fn encode_request(&self, req: &mut Request, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let info = req.ns_head.clone().unwrap_or_default();
        Ok(encode_nshead(&info, req.log_id, &req.body))
    }

    fn encode_response(&self, resp: &Response, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        if let Some((code, text)) = &resp.error {
            // the head has no error field; an empty body with the reserved
            // word carrying the code is the closest wire-expressible form
            warn!("nshead response {} carries error {}: {}", resp.log_id, code, text);
        }
        Ok(encode_nshead(&NsHeadInfo::default(), resp.log_id, &resp.body))
    }
}

fn encode_nshead(info: &NsHeadInfo, log_id: u64, body: &[u8]) -> Bytes {
    let head = NsHead {
        id: U16::new(info.id),
        version: U16::new(info.version),
        log_id: U32::new(log_id as u32),
        provider: info.provider,
        magic_num: U32::new(NSHEAD_MAGIC),
        reserved: U32::new(0),
        body_len: U32::new(body.len() as u32),
    };
    let mut out = bytes::BytesMut::with_capacity(NSHEAD_LEN + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_len() {
        assert_eq!(NSHEAD_LEN, 36);
    }

    #[test]
    fn test_roundtrip() {
        let mut provider = [0u8; 16];
        provider[..5].copy_from_slice(b"pbrpc");
        let mut req = Request {
            log_id: 77,
            ns_head: Some(NsHeadInfo { id: 1, version: 1, provider }),
            body: Bytes::from_static(b"nshead-body"),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = NsHeadCodec.encode_request(&mut req, &mut conn).expect("encode");
        assert_eq!(buf.len(), 36 + 11);

        let mut acc = BufferStore::new();
        acc.append(buf);
        let raw = NsHeadCodec.decode(&mut acc, &mut conn).expect("decode");
        let mut back = Request::default();
        NsHeadCodec.decode_request(raw, &mut back).expect("decode_request");
        assert_eq!(back.log_id, 77);
        assert_eq!(&back.body[..], b"nshead-body");
        assert_eq!(back.ns_head.expect("info").id, 1);
    }

    #[test]
    fn test_bad_magic() {
        let mut head = vec![0u8; 36];
        head[24..28].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        let mut acc = BufferStore::new();
        acc.append(Bytes::from(head));
        let mut conn = ConnState::new(ConnRole::Server);
        assert_eq!(NsHeadCodec.decode(&mut acc, &mut conn).unwrap_err(), DecodeError::BadSchema);
    }

    #[test]
    fn test_short_head_waits() {
        let mut acc = BufferStore::new();
        acc.append(Bytes::from_static(b"\x01\x00\x01\x00"));
        let mut conn = ConnState::new(ConnRole::Server);
        assert_eq!(
            NsHeadCodec.decode(&mut acc, &mut conn).unwrap_err(),
            DecodeError::NotEnoughData
        );
        assert_eq!(acc.readable(), 4);
    }
}
