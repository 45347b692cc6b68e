//! SoFa pbrpc protocol.
//!
//! Same length-prefixed family as Hulu, little-endian size fields, one meta
//! message for both directions with a type discriminator and the full
//! `"service.method"` string.

use super::*;
use bytes::Bytes;
use polyrpc_core::error::{DecodeError, RpcError};
use polyrpc_core::{BufferStore, CompressType};
use prost::Message;

pub const MAGIC: &[u8; 4] = b"SOFA";

pub const META_TYPE_REQUEST: i32 = 0;
pub const META_TYPE_RESPONSE: i32 = 1;

#[derive(Clone, PartialEq, prost::Message)]
pub struct SofaRpcMeta {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(int32, tag = "2")]
    pub version: i32,
    #[prost(int64, tag = "3")]
    pub sequence_id: i64,
    /// Full `"service.method"` name.
    #[prost(string, tag = "4")]
    pub method: String,
    #[prost(int32, tag = "5")]
    pub error_code: i32,
    #[prost(string, tag = "6")]
    pub reason: String,
    #[prost(int32, tag = "7")]
    pub compress_type: i32,
    #[prost(int32, tag = "8")]
    pub user_message_size: i32,
}

pub struct SofaCodec;

impl SofaCodec {
    /// `"pkg.Service.Method"` splits at the last dot.
    fn split_method(full: &str) -> Result<(String, String), RpcError> {
        match full.rsplit_once('.') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {
                Ok((service.to_string(), method.to_string()))
            }
            _ => Err(RpcError::serialization(format!("malformed sofa method {:?}", full))),
        }
    }
}

impl ProtocolCodec for SofaCodec {
    #[inline]
    fn id(&self) -> ProtocolId {
        ProtocolId::Sofa
    }

    fn decode(
        &self, acc: &mut BufferStore, _conn: &mut ConnState,
    ) -> Result<RawPacket, DecodeError> {
        decode_length_prefixed(acc, MAGIC, true)
    }

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("sofa expects a framed packet"));
        };
        let meta = SofaRpcMeta::decode(&meta[..])
            .map_err(|e| RpcError::serialization(format!("sofa meta: {}", e)))?;
        if meta.r#type != META_TYPE_REQUEST {
            return Err(RpcError::serialization("sofa request meta has response type"));
        }
        let (service_name, method_name) = Self::split_method(&meta.method)?;
        req.log_id = meta.sequence_id as u64;
        req.compress = CompressType::from_code(meta.compress_type)?;
        req.service_name = service_name;
        req.method = MethodKey::Name(method_name);
        let (msg, att) = split_attachment(body, meta.user_message_size as usize)?;
        req.body = msg;
        req.attachment = att;
        Ok(())
    }

    fn decode_response(&self, raw: RawPacket, _conn: &mut ConnState) -> Result<Response, RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("sofa expects a framed packet"));
        };
        let meta = SofaRpcMeta::decode(&meta[..])
            .map_err(|e| RpcError::serialization(format!("sofa meta: {}", e)))?;
        if meta.r#type != META_TYPE_RESPONSE {
            return Err(RpcError::serialization("sofa response meta has request type"));
        }
        let mut resp = Response {
            log_id: meta.sequence_id as u64,
            compress: CompressType::from_code(meta.compress_type)?,
            ..Default::default()
        };
        if meta.error_code != 0 {
            resp.error = Some((meta.error_code, meta.reason));
            return Ok(resp);
        }
        let (msg, att) = split_attachment(body, meta.user_message_size as usize)?;
        resp.body = msg;
        resp.attachment = att;
        Ok(resp)
    }

    fn encode_request(&self, req: &mut Request, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let method_name = match &req.method {
            MethodKey::Name(name) => name.clone(),
            MethodKey::Index(idx) => idx.to_string(),
        };
        let meta = SofaRpcMeta {
            r#type: META_TYPE_REQUEST,
            version: 1,
            sequence_id: req.log_id as i64,
            method: format!("{}.{}", req.service_name, method_name),
            compress_type: req.compress.code(),
            user_message_size: if req.attachment.is_some() { req.body.len() as i32 } else { 0 },
            ..Default::default()
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
        let mut meta = SofaRpcMeta {
            r#type: META_TYPE_RESPONSE,
            version: 1,
            sequence_id: resp.log_id as i64,
            compress_type: resp.compress.code(),
            ..Default::default()
        };
        match &resp.error {
            Some((code, text)) => {
                meta.error_code = *code;
                meta.reason = text.clone();
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
    fn test_method_name_split() {
        let (s, m) = SofaCodec::split_method("example.EchoService.Echo").expect("split");
        assert_eq!(s, "example.EchoService");
        assert_eq!(m, "Echo");
        assert!(SofaCodec::split_method("NoDotsHere").is_err());
        assert!(SofaCodec::split_method("trailing.").is_err());
    }

    #[test]
    fn test_request_roundtrip() {
        let mut req = Request {
            log_id: 11,
            service_name: "example.EchoService".to_string(),
            method: MethodKey::Name("Echo".to_string()),
            body: Bytes::from_static(b"msg"),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = SofaCodec.encode_request(&mut req, &mut conn).expect("encode");
        assert_eq!(&buf[..4], b"SOFA");
        let mut acc = BufferStore::new();
        acc.append(buf);
        let raw = SofaCodec.decode(&mut acc, &mut conn).expect("decode");
        let mut back = Request::default();
        SofaCodec.decode_request(raw, &mut back).expect("decode_request");
        assert_eq!(back.log_id, 11);
        assert_eq!(back.service_name, "example.EchoService");
        assert_eq!(back.method, MethodKey::Name("Echo".to_string()));
    }

    #[test]
    fn test_response_type_mismatch() {
        let mut req = Request {
            log_id: 2,
            service_name: "a.B".to_string(),
            method: MethodKey::Name("c".to_string()),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = SofaCodec.encode_request(&mut req, &mut conn).expect("encode");
        let mut acc = BufferStore::new();
        acc.append(buf);
        let raw = SofaCodec.decode(&mut acc, &mut conn).expect("decode");
        // a request packet fed to the response path must not parse
        assert!(SofaCodec.decode_response(raw, &mut conn).is_err());
    }
}
