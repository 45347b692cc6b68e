//! Hulu pbrpc protocol.
//!
//! Framing `["HULU"][body_size: u32 LE][meta_size: u32 LE][meta][body]`.
//! The two size fields are NOT in network byte order; do not normalize.
//! Methods are addressed by proto sequence number, and `user_message_size`
//! names the message/attachment boundary when an attachment rides along.

use super::*;
use bytes::Bytes;
use polyrpc_core::error::{DecodeError, RpcError};
use polyrpc_core::{BufferStore, CompressType};
use prost::Message;

pub const MAGIC: &[u8; 4] = b"HULU";

#[derive(Clone, PartialEq, prost::Message)]
pub struct HuluRequestMeta {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(int32, tag = "2")]
    pub method_index: i32,
    #[prost(int32, tag = "3")]
    pub compress_type: i32,
    #[prost(int64, tag = "4")]
    pub correlation_id: i64,
    #[prost(int64, tag = "5")]
    pub log_id: i64,
    #[prost(int32, tag = "6")]
    pub user_message_size: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HuluResponseMeta {
    #[prost(int64, tag = "1")]
    pub correlation_id: i64,
    #[prost(int32, tag = "2")]
    pub error_code: i32,
    #[prost(string, tag = "3")]
    pub error_text: String,
    #[prost(int32, tag = "4")]
    pub compress_type: i32,
    #[prost(int32, tag = "5")]
    pub user_message_size: i32,
}

pub struct HuluCodec;

impl HuluCodec {
    /// Hulu addresses methods by index; a non-numeric name cannot be
    /// encoded and must fail before any bytes are written.
    fn method_index_of(req: &Request) -> Result<i32, RpcError> {
        match &req.method {
            MethodKey::Index(idx) => Ok(*idx),
            MethodKey::Name(name) => name.parse::<i32>().map_err(|_| {
                RpcError::serialization(format!(
                    "method name {:?} must be the proto method sequence number for hulu",
                    name
                ))
            }),
        }
    }
}

impl ProtocolCodec for HuluCodec {
    #[inline]
    fn id(&self) -> ProtocolId {
        ProtocolId::Hulu
    }

    fn decode(
        &self, acc: &mut BufferStore, _conn: &mut ConnState,
    ) -> Result<RawPacket, DecodeError> {
        decode_length_prefixed(acc, MAGIC, true)
    }

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("hulu expects a framed packet"));
        };
        let meta = HuluRequestMeta::decode(&meta[..])
            .map_err(|e| RpcError::serialization(format!("hulu request meta: {}", e)))?;
        req.log_id = meta.correlation_id as u64;
        req.compress = CompressType::from_code(meta.compress_type)?;
        req.service_name = meta.service_name;
        req.method = MethodKey::Index(meta.method_index);
        let (msg, att) = split_attachment(body, meta.user_message_size as usize)?;
        req.body = msg;
        req.attachment = att;
        Ok(())
    }

    fn decode_response(&self, raw: RawPacket, _conn: &mut ConnState) -> Result<Response, RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("hulu expects a framed packet"));
        };
        let meta = HuluResponseMeta::decode(&meta[..])
            .map_err(|e| RpcError::serialization(format!("hulu response meta: {}", e)))?;
        let mut resp = Response {
            log_id: meta.correlation_id as u64,
            compress: CompressType::from_code(meta.compress_type)?,
            ..Default::default()
        };
        if meta.error_code != 0 {
            resp.error = Some((meta.error_code, meta.error_text));
            return Ok(resp);
        }
        let (msg, att) = split_attachment(body, meta.user_message_size as usize)?;
        resp.body = msg;
        resp.attachment = att;
        Ok(resp)
    }

    fn encode_request(&self, req: &mut Request, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let method_index = Self::method_index_of(req)?;
        let meta = HuluRequestMeta {
            service_name: req.service_name.clone(),
            method_index,
            compress_type: req.compress.code(),
            correlation_id: req.log_id as i64,
            log_id: req.log_id as i64,
            user_message_size: if req.attachment.is_some() { req.body.len() as i32 } else { 0 },
        };
        Ok(encode_length_prefixed(
            MAGIC,
            true,
            &meta.encode_to_vec(),
            &req.body,
            req.attachment.as_deref(),
        ))
    }

    fn encode_response(&self, resp: &Response, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let mut meta = HuluResponseMeta {
            correlation_id: resp.log_id as i64,
            compress_type: resp.compress.code(),
            ..Default::default()
        };
        match &resp.error {
            Some((code, text)) => {
                meta.error_code = *code;
                meta.error_text = text.clone();
                Ok(encode_length_prefixed(MAGIC, true, &meta.encode_to_vec(), &[], None))
            }
            None => {
                if resp.attachment.is_some() {
                    meta.user_message_size = resp.body.len() as i32;
                }
                Ok(encode_length_prefixed(
                    MAGIC,
                    true,
                    &meta.encode_to_vec(),
                    &resp.body,
                    resp.attachment.as_deref(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_are_little_endian() {
        let mut req = Request {
            log_id: 1,
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Index(0),
            body: Bytes::from_static(b"payload"),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = HuluCodec.encode_request(&mut req, &mut conn).expect("encode");
        assert_eq!(&buf[..4], b"HULU");
        let body_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        assert_eq!(body_size, buf.len() - 12);
    }

    #[test]
    fn test_non_numeric_method_name_fails_before_encode() {
        let mut req = Request {
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Name("Echo".to_string()),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let err = HuluCodec.encode_request(&mut req, &mut conn).unwrap_err();
        assert_eq!(err.kind, polyrpc_core::error::RpcErrorKind::SerializationFailure);
    }

    #[test]
    fn test_numeric_method_name_is_accepted() {
        let mut req = Request {
            log_id: 3,
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Name("0".to_string()),
            body: Bytes::from_static(b"x"),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = HuluCodec.encode_request(&mut req, &mut conn).expect("encode");
        let mut acc = BufferStore::new();
        acc.append(buf);
        let raw = HuluCodec.decode(&mut acc, &mut conn).expect("decode");
        let mut back = Request::default();
        HuluCodec.decode_request(raw, &mut back).expect("decode_request");
        assert_eq!(back.method, MethodKey::Index(0));
        assert_eq!(back.log_id, 3);
    }

    #[test]
    fn test_attachment_roundtrip() {
        let mut req = Request {
            log_id: 5,
            service_name: "fs.FileService".to_string(),
            method: MethodKey::Index(2),
            body: Bytes::from_static(b"12345678"),
            attachment: Some(Bytes::from_static(b"blob-bytes")),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = HuluCodec.encode_request(&mut req, &mut conn).expect("encode");
        let mut acc = BufferStore::new();
        acc.append(buf);
        let raw = HuluCodec.decode(&mut acc, &mut conn).expect("decode");
        let mut back = Request::default();
        HuluCodec.decode_request(raw, &mut back).expect("decode_request");
        assert_eq!(&back.body[..], b"12345678");
        assert_eq!(&back.attachment.expect("attachment")[..], b"blob-bytes");
    }
}
