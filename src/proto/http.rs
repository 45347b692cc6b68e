//! HTTP/1.1 protocol, JSON or protobuf body.
//!
//! The request path is `/<service>/<method>`; `content-type` selects the
//! body form; vendor headers carry correlation id, compression and the
//! attachment boundary. Head parsing is prefix-safe (`httparse` reports
//! `Partial` on a short read), which the detection order relies on.
//!
//! Responses on one connection are serialized in request arrival order:
//! HTTP/1.1 pipelining has no correlation header the peer is required to
//! echo, so wire order is the contract here.

use super::*;
use bytes::Bytes;
use polyrpc_core::error::{DecodeError, RpcError, RpcErrorKind};
use polyrpc_core::{BufferStore, CompressType, MAX_BODY_SIZE};
use std::fmt;

pub const HDR_LOG_ID: &str = "log-id";
pub const HDR_COMPRESS_TYPE: &str = "compress-type";
pub const HDR_ATTACHMENT_LEN: &str = "attachment-length";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_PROTO: &str = "application/proto";

const MAX_HEADERS: usize = 64;

/// Parsed head plus the framed body, before meta routing.
pub struct HttpPacket {
    pub is_request: bool,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Header names lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpPacket {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for HttpPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_request {
            write!(f, "http({} {}, body={}B)", self.method, self.path, self.body.len())
        } else {
            write!(f, "http({}, body={}B)", self.status, self.body.len())
        }
    }
}

/// Body framing computed from the head: where the body starts and how long
/// it is, or `NotEnoughData` when the accumulator cannot answer yet.
enum BodyFraming {
    Sized { head_len: usize, body_len: usize },
    /// Chunked: body decoded up front since chunk boundaries are not slices.
    Chunked { total_len: usize, body: Bytes },
}

fn frame_body(
    data: &[u8], head_len: usize, headers: &[(String, String)],
) -> Result<BodyFraming, DecodeError> {
    let find = |name: &str| {
        headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    };
    if let Some(te) = find("transfer-encoding") {
        if te.eq_ignore_ascii_case("chunked") {
            return frame_chunked(data, head_len);
        }
    }
    let body_len = match find("content-length") {
        Some(v) => v.trim().parse::<usize>().map_err(|_| DecodeError::BadSchema)?,
        None => 0,
    };
    if body_len > MAX_BODY_SIZE {
        return Err(DecodeError::TooBigData);
    }
    if data.len() < head_len + body_len {
        return Err(DecodeError::NotEnoughData);
    }
    Ok(BodyFraming::Sized { head_len, body_len })
}

fn frame_chunked(data: &[u8], head_len: usize) -> Result<BodyFraming, DecodeError> {
    let mut pos = head_len;
    let mut body = bytes::BytesMut::new();
    loop {
        let line_end = find_crlf(&data[pos..]).ok_or(DecodeError::NotEnoughData)? + pos;
        let size_str = std::str::from_utf8(&data[pos..line_end])
            .map_err(|_| DecodeError::BadSchema)?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| DecodeError::BadSchema)?;
        if body.len() + size > MAX_BODY_SIZE {
            return Err(DecodeError::TooBigData);
        }
        pos = line_end + 2;
        if size == 0 {
            // no trailer support: expect the final CRLF immediately
            if data.len() < pos + 2 {
                return Err(DecodeError::NotEnoughData);
            }
            if &data[pos..pos + 2] != b"\r\n" {
                return Err(DecodeError::BadSchema);
            }
            return Ok(BodyFraming::Chunked { total_len: pos + 2, body: body.freeze() });
        }
        if data.len() < pos + size + 2 {
            return Err(DecodeError::NotEnoughData);
        }
        body.extend_from_slice(&data[pos..pos + size]);
        if &data[pos + size..pos + size + 2] != b"\r\n" {
            return Err(DecodeError::BadSchema);
        }
        pos += size + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

pub struct HttpCodec;

impl ProtocolCodec for HttpCodec {
    #[inline]
    fn id(&self) -> ProtocolId {
        ProtocolId::Http
    }

    fn decode(&self, acc: &mut BufferStore, conn: &mut ConnState) -> Result<RawPacket, DecodeError> {
        let role = conn.role;
        let packet;
        let framing;
        {
            let data = acc.contiguous();
            if data.is_empty() {
                return Err(DecodeError::NotEnoughData);
            }
            let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let (head_len, headers, head) = if role == ConnRole::Server {
                let mut parsed = httparse::Request::new(&mut header_buf);
                match parsed.parse(data) {
                    Ok(httparse::Status::Complete(n)) => {
                        let headers = collect_headers(parsed.headers);
                        let head = (
                            parsed.method.unwrap_or("").to_string(),
                            parsed.path.unwrap_or("").to_string(),
                            0u16,
                        );
                        (n, headers, head)
                    }
                    Ok(httparse::Status::Partial) => return Err(DecodeError::NotEnoughData),
                    Err(_) => return Err(DecodeError::BadSchema),
                }
            } else {
                let mut parsed = httparse::Response::new(&mut header_buf);
                match parsed.parse(data) {
                    Ok(httparse::Status::Complete(n)) => {
                        let headers = collect_headers(parsed.headers);
                        let head = (String::new(), String::new(), parsed.code.unwrap_or(0));
                        (n, headers, head)
                    }
                    Ok(httparse::Status::Partial) => return Err(DecodeError::NotEnoughData),
                    Err(_) => return Err(DecodeError::BadSchema),
                }
            };
            framing = frame_body(data, head_len, &headers)?;
            packet = HttpPacket {
                is_request: role == ConnRole::Server,
                method: head.0,
                path: head.1,
                status: head.2,
                headers,
                body: Bytes::new(),
            };
        }
        let mut packet = packet;
        match framing {
            BodyFraming::Sized { head_len, body_len } => {
                acc.skip(head_len)?;
                packet.body = acc.read_retained_slice(body_len)?;
            }
            BodyFraming::Chunked { total_len, body } => {
                acc.skip(total_len)?;
                packet.body = body;
            }
        }
        Ok(RawPacket::Http(packet))
    }

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError> {
        let RawPacket::Http(packet) = raw else {
            return Err(RpcError::serialization("http expects an http packet"));
        };
        if !packet.is_request {
            return Err(RpcError::serialization("http response packet on the request path"));
        }
        let mut parts = packet.path.trim_matches('/').splitn(2, '/');
        let service = parts.next().unwrap_or("");
        let method = parts.next().unwrap_or("");
        if service.is_empty() || method.is_empty() {
            return Err(RpcError::serialization(format!(
                "path {:?} does not name /service/method",
                packet.path
            )));
        }
        req.service_name = service.to_string();
        req.method = MethodKey::Name(method.to_string());
        req.log_id = packet
            .header(HDR_LOG_ID)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let code = packet
            .header(HDR_COMPRESS_TYPE)
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(0);
        req.compress = CompressType::from_code(code)?;
        req.json_body = match packet.header("content-type") {
            Some(ct) if ct.starts_with(CONTENT_TYPE_PROTO) => false,
            // json unless protobuf is explicit
            _ => true,
        };
        let att_len = packet
            .header(HDR_ATTACHMENT_LEN)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if att_len > packet.body.len() {
            return Err(RpcError::serialization("attachment-length exceeds body"));
        }
        let reserved = [HDR_LOG_ID, HDR_COMPRESS_TYPE, HDR_ATTACHMENT_LEN, "content-type",
            "content-length", "transfer-encoding", "host", "connection"];
        req.kv_attachment = packet
            .headers
            .iter()
            .filter(|(k, _)| !reserved.contains(&k.as_str()))
            .cloned()
            .collect();
        if att_len > 0 {
            let msg_len = packet.body.len() - att_len;
            req.body = packet.body.slice(..msg_len);
            req.attachment = Some(packet.body.slice(msg_len..));
        } else {
            req.body = packet.body;
        }
        Ok(())
    }

    fn decode_response(&self, raw: RawPacket, _conn: &mut ConnState) -> Result<Response, RpcError> {
        let RawPacket::Http(packet) = raw else {
            return Err(RpcError::serialization("http expects an http packet"));
        };
        if packet.is_request {
            return Err(RpcError::serialization("http request packet on the response path"));
        }
        let log_id = packet
            .header(HDR_LOG_ID)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let mut resp = Response { log_id, ..Default::default() };
        if packet.status != 200 {
            let text = String::from_utf8_lossy(&packet.body).into_owned();
            resp.error = Some((packet.status as i32, text));
            return Ok(resp);
        }
        let code = packet
            .header(HDR_COMPRESS_TYPE)
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(0);
        resp.compress = CompressType::from_code(code)?;
        resp.json_body = !matches!(
            packet.header("content-type"),
            Some(ct) if ct.starts_with(CONTENT_TYPE_PROTO)
        );
        let att_len = packet
            .header(HDR_ATTACHMENT_LEN)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if att_len > packet.body.len() {
            return Err(RpcError {
                kind: RpcErrorKind::SerializationFailure,
                code: polyrpc_core::error::errno::ERESPONSE,
                message: "attachment-length exceeds body".to_string(),
            });
        }
        if att_len > 0 {
            let msg_len = packet.body.len() - att_len;
            resp.body = packet.body.slice(..msg_len);
            resp.attachment = Some(packet.body.slice(msg_len..));
        } else {
            resp.body = packet.body;
        }
        Ok(resp)
    }

    fn encode_request(&self, req: &mut Request, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let method_name = match &req.method {
            MethodKey::Name(name) => name.clone(),
            MethodKey::Index(idx) => idx.to_string(),
        };
        let content_type = if req.json_body { CONTENT_TYPE_JSON } else { CONTENT_TYPE_PROTO };
        let att_len = req.attachment.as_ref().map(|a| a.len()).unwrap_or(0);
        let total = req.body.len() + att_len;
        let mut head = format!(
            "POST /{}/{} HTTP/1.1\r\ncontent-type: {}\r\ncontent-length: {}\r\n{}: {}\r\n{}: {}\r\n",
            req.service_name,
            method_name,
            content_type,
            total,
            HDR_LOG_ID,
            req.log_id,
            HDR_COMPRESS_TYPE,
            req.compress.code(),
        );
        if att_len > 0 {
            head.push_str(&format!("{}: {}\r\n", HDR_ATTACHMENT_LEN, att_len));
        }
        for (k, v) in &req.kv_attachment {
            head.push_str(&format!("{}: {}\r\n", k, v));
        }
        head.push_str("\r\n");
        let mut out = bytes::BytesMut::with_capacity(head.len() + total);
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&req.body);
        if let Some(att) = &req.attachment {
            out.extend_from_slice(att);
        }
        Ok(out.freeze())
    }

    fn encode_response(&self, resp: &Response, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        if let Some((code, text)) = &resp.error {
            let status = if (400..600).contains(code) { *code } else { 500 };
            let head = format!(
                "HTTP/1.1 {} RPC Error\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n{}: {}\r\n\r\n",
                status,
                text.len(),
                HDR_LOG_ID,
                resp.log_id,
            );
            let mut out = bytes::BytesMut::with_capacity(head.len() + text.len());
            out.extend_from_slice(head.as_bytes());
            out.extend_from_slice(text.as_bytes());
            return Ok(out.freeze());
        }
        let content_type = if resp.json_body { CONTENT_TYPE_JSON } else { CONTENT_TYPE_PROTO };
        let att_len = resp.attachment.as_ref().map(|a| a.len()).unwrap_or(0);
        let total = resp.body.len() + att_len;
        let mut head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ncontent-length: {}\r\n{}: {}\r\n{}: {}\r\n",
            content_type,
            total,
            HDR_LOG_ID,
            resp.log_id,
            HDR_COMPRESS_TYPE,
            resp.compress.code(),
        );
        if att_len > 0 {
            head.push_str(&format!("{}: {}\r\n", HDR_ATTACHMENT_LEN, att_len));
        }
        head.push_str("\r\n");
        let mut out = bytes::BytesMut::with_capacity(head.len() + total);
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&resp.body);
        if let Some(att) = &resp.attachment {
            out.extend_from_slice(att);
        }
        Ok(out.freeze())
    }
}

fn collect_headers(parsed: &[httparse::Header]) -> Vec<(String, String)> {
    parsed
        .iter()
        .map(|h| {
            (h.name.to_ascii_lowercase(), String::from_utf8_lossy(h.value).into_owned())
        })
        .collect()
}
