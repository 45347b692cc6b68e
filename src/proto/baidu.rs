//! Baidu-std protocol.
//!
//! Framing `["PRPC"][body_size: u32 BE][meta_size: u32 BE][meta][body]`;
//! the meta is a protobuf [RpcMeta] carrying correlation id, compression and
//! routing, and the trailing `attachment_size` bytes of the body are the
//! binary attachment.

use super::*;
use bytes::Bytes;
use polyrpc_core::error::{errno, DecodeError, RpcError};
use polyrpc_core::{BufferStore, CompressType};
use prost::Message;

pub const MAGIC: &[u8; 4] = b"PRPC";

#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcMeta {
    #[prost(message, optional, tag = "1")]
    pub request: Option<RpcRequestMeta>,
    #[prost(message, optional, tag = "2")]
    pub response: Option<RpcResponseMeta>,
    #[prost(int32, tag = "3")]
    pub compress_type: i32,
    #[prost(int64, tag = "4")]
    pub correlation_id: i64,
    #[prost(int32, tag = "5")]
    pub attachment_size: i32,
    #[prost(bytes = "vec", tag = "6")]
    pub authentication_data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcRequestMeta {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub method_name: String,
    #[prost(int64, tag = "3")]
    pub log_id: i64,
    #[prost(int64, tag = "4")]
    pub trace_id: i64,
    #[prost(int64, tag = "5")]
    pub span_id: i64,
    #[prost(int64, tag = "6")]
    pub parent_span_id: i64,
    #[prost(message, repeated, tag = "7")]
    pub ext_fields: Vec<RpcMetaExtField>,
    /// Per-call deadline; zero means the server default applies.
    #[prost(int32, tag = "8")]
    pub timeout_ms: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcResponseMeta {
    #[prost(int32, tag = "1")]
    pub error_code: i32,
    #[prost(string, tag = "2")]
    pub error_text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcMetaExtField {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

pub struct BaiduStdCodec;

impl BaiduStdCodec {
    fn build_request_meta(req: &Request) -> RpcMeta {
        let ext_fields = req
            .kv_attachment
            .iter()
            .map(|(k, v)| RpcMetaExtField { key: k.clone(), value: v.clone() })
            .collect();
        RpcMeta {
            request: Some(RpcRequestMeta {
                service_name: req.service_name.clone(),
                method_name: match &req.method {
                    MethodKey::Name(name) => name.clone(),
                    MethodKey::Index(idx) => idx.to_string(),
                },
                log_id: req.log_id as i64,
                trace_id: req.trace_id,
                span_id: req.span_id,
                parent_span_id: req.parent_span_id,
                ext_fields,
                timeout_ms: req
                    .write_timeout
                    .map(|t| t.as_millis() as i32)
                    .unwrap_or(0),
            }),
            response: None,
            compress_type: req.compress.code(),
            correlation_id: req.log_id as i64,
            attachment_size: req.attachment.as_ref().map(|a| a.len() as i32).unwrap_or(0),
            authentication_data: Vec::new(),
        }
    }
}

impl ProtocolCodec for BaiduStdCodec {
    #[inline]
    fn id(&self) -> ProtocolId {
        ProtocolId::BaiduStd
    }

    fn decode(
        &self, acc: &mut BufferStore, _conn: &mut ConnState,
    ) -> Result<RawPacket, DecodeError> {
        decode_length_prefixed(acc, MAGIC, false)
    }

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("baidu-std expects a framed packet"));
        };
        let meta = RpcMeta::decode(&meta[..])
            .map_err(|e| RpcError::serialization(format!("rpc meta: {}", e)))?;
        let request_meta = meta
            .request
            .ok_or_else(|| RpcError::serialization("request meta missing"))?;
        req.log_id = meta.correlation_id as u64;
        req.compress = CompressType::from_code(meta.compress_type)?;
        req.service_name = request_meta.service_name;
        req.method = MethodKey::Name(request_meta.method_name);
        req.trace_id = request_meta.trace_id;
        req.span_id = request_meta.span_id;
        req.parent_span_id = request_meta.parent_span_id;
        if request_meta.timeout_ms > 0 {
            req.write_timeout =
                Some(std::time::Duration::from_millis(request_meta.timeout_ms as u64));
        }
        req.kv_attachment =
            request_meta.ext_fields.into_iter().map(|f| (f.key, f.value)).collect();
        let att_size = meta.attachment_size as usize;
        if att_size > body.len() {
            return Err(RpcError::serialization(format!(
                "attachment_size {} exceeds body {}",
                att_size,
                body.len()
            )));
        }
        if att_size > 0 {
            let msg_size = body.len() - att_size;
            req.body = body.slice(..msg_size);
            req.attachment = Some(body.slice(msg_size..));
        } else {
            req.body = body;
        }
        Ok(())
    }

    fn decode_response(&self, raw: RawPacket, _conn: &mut ConnState) -> Result<Response, RpcError> {
        let RawPacket::Framed { meta, body } = raw else {
            return Err(RpcError::serialization("baidu-std expects a framed packet"));
        };
        let meta = RpcMeta::decode(&meta[..])
            .map_err(|e| RpcError::serialization(format!("rpc meta: {}", e)))?;
        let mut resp = Response {
            log_id: meta.correlation_id as u64,
            compress: CompressType::from_code(meta.compress_type)?,
            ..Default::default()
        };
        let response_meta = meta.response.unwrap_or_default();
        if response_meta.error_code != 0 {
            resp.error = Some((response_meta.error_code, response_meta.error_text));
            return Ok(resp);
        }
        let att_size = meta.attachment_size as usize;
        if att_size > body.len() {
            return Err(RpcError {
                kind: polyrpc_core::error::RpcErrorKind::SerializationFailure,
                code: errno::ERESPONSE,
                message: format!("attachment_size {} exceeds body {}", att_size, body.len()),
            });
        }
        if att_size > 0 {
            let msg_size = body.len() - att_size;
            resp.body = body.slice(..msg_size);
            resp.attachment = Some(body.slice(msg_size..));
        } else {
            resp.body = body;
        }
        Ok(resp)
    }

    fn encode_request(&self, req: &mut Request, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let meta = Self::build_request_meta(req);
        Ok(encode_length_prefixed(
            MAGIC,
            false,
            &meta.encode_to_vec(),
            &req.body,
            req.attachment.as_deref(),
        ))
    }

    fn encode_response(&self, resp: &Response, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let mut meta = RpcMeta {
            correlation_id: resp.log_id as i64,
            compress_type: resp.compress.code(),
            ..Default::default()
        };
        match &resp.error {
            Some((code, text)) => {
                meta.response =
                    Some(RpcResponseMeta { error_code: *code, error_text: text.clone() });
                Ok(encode_length_prefixed(MAGIC, false, &meta.encode_to_vec(), &[], None))
            }
            None => {
                meta.response = Some(RpcResponseMeta::default());
                meta.attachment_size =
                    resp.attachment.as_ref().map(|a| a.len() as i32).unwrap_or(0);
                Ok(encode_length_prefixed(
                    MAGIC,
                    false,
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

    fn decode_one(buf: Bytes) -> RawPacket {
        let mut acc = BufferStore::new();
        acc.append(buf);
        let mut conn = ConnState::new(ConnRole::Server);
        let packet = BaiduStdCodec.decode(&mut acc, &mut conn).expect("decode");
        assert!(acc.is_empty(), "decode must consume the whole packet");
        packet
    }

    #[test]
    fn test_request_roundtrip() {
        let mut req = Request {
            log_id: 42,
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Name("Echo".to_string()),
            body: Bytes::from_static(b"\x0a\x02hi"),
            kv_attachment: vec![("caller".to_string(), "test".to_string())],
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = BaiduStdCodec.encode_request(&mut req, &mut conn).expect("encode");
        assert_eq!(&buf[..4], b"PRPC");

        let mut back = Request::default();
        BaiduStdCodec.decode_request(decode_one(buf), &mut back).expect("decode_request");
        assert_eq!(back.log_id, 42);
        assert_eq!(back.service_name, "echo.EchoService");
        assert_eq!(back.method, MethodKey::Name("Echo".to_string()));
        assert_eq!(&back.body[..], b"\x0a\x02hi");
        assert!(back.attachment.is_none());
        assert_eq!(back.kv_attachment, vec![("caller".to_string(), "test".to_string())]);
    }

    #[test]
    fn test_attachment_split() {
        let mut req = Request {
            log_id: 7,
            service_name: "echo.EchoService".to_string(),
            method: MethodKey::Name("Echo".to_string()),
            body: Bytes::from_static(b"01234567"),
            attachment: Some(Bytes::from_static(b"0123456789abcdef")),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Client);
        let buf = BaiduStdCodec.encode_request(&mut req, &mut conn).expect("encode");

        let mut back = Request::default();
        BaiduStdCodec.decode_request(decode_one(buf), &mut back).expect("decode_request");
        assert_eq!(back.body.len(), 8);
        let att = back.attachment.expect("attachment");
        assert_eq!(&att[..], b"0123456789abcdef");
    }

    #[test]
    fn test_error_response() {
        let resp = Response {
            log_id: 9,
            error: Some((errno::ENOMETHOD, "no such method".to_string())),
            ..Default::default()
        };
        let mut conn = ConnState::new(ConnRole::Server);
        let buf = BaiduStdCodec.encode_response(&resp, &mut conn).expect("encode");
        let back = BaiduStdCodec
            .decode_response(decode_one(buf), &mut conn)
            .expect("decode_response");
        assert_eq!(back.log_id, 9);
        let (code, text) = back.error.expect("error");
        assert_eq!(code, errno::ENOMETHOD);
        assert_eq!(text, "no such method");
    }

    #[test]
    fn test_wrong_magic_is_bad_schema() {
        let mut acc = BufferStore::new();
        acc.append(Bytes::from_static(b"HULU\x00\x00\x00\x04\x00\x00\x00\x00body"));
        let mut conn = ConnState::new(ConnRole::Server);
        assert_eq!(
            BaiduStdCodec.decode(&mut acc, &mut conn).unwrap_err(),
            DecodeError::BadSchema
        );
        assert_eq!(acc.readable(), 16);
    }
}
