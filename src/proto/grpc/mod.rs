//! gRPC over HTTP/2.
//!
//! Each RPC is one stream: request HEADERS (`:path = /<service>/<method>`,
//! `te: trailers`, `content-type: application/grpc`), DATA frames carrying
//! `[compressed: u8][len: u32 BE][payload]`, and trailers with
//! `grpc-status`/`grpc-message`. Binding a connection to this codec also
//! pins the connection preface and SETTINGS negotiation here; everything the
//! peer is owed in return (SETTINGS, acks, pongs) queues in [H2Conn] and is
//! flushed by the connection writer.

use super::*;
use bytes::{Bytes, BytesMut};
use polyrpc_core::error::{errno, DecodeError, RpcError};
use polyrpc_core::{BufferStore, CompressType, MAX_BODY_SIZE};
use std::collections::{HashMap, VecDeque};

pub mod frame;
pub mod hpack;

use self::frame::*;

/// Stream state machine:
/// `Idle -> HeadersReceived -> DataReceived* -> (end | trailers | RST) -> Closed`.
/// Closed streams leave the map; any other transition is a schema error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    HeadersReceived,
    DataReceived,
}

struct Stream {
    phase: StreamPhase,
    headers: Vec<(String, String)>,
    data: BytesMut,
}

/// One completed stream, ready for meta routing.
pub struct GrpcCall {
    pub stream_id: u32,
    pub headers: Vec<(String, String)>,
    pub trailers: Vec<(String, String)>,
    /// Concatenated DATA payload, still gRPC message framed.
    pub data: Bytes,
    /// Set when the stream ended by RST_STREAM.
    pub rst: Option<u32>,
}

impl GrpcCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        self.trailers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for GrpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "grpc(stream={}, data={}B, rst={:?})", self.stream_id, self.data.len(), self.rst)
    }
}

/// Per-connection HTTP/2 state, owned by the framing engine via [ConnState].
pub struct H2Conn {
    role: ConnRole,
    preface_done: bool,
    settings_sent: bool,
    hpack_dec: hpack::Decoder,
    streams: HashMap<u32, Stream>,
    ready: VecDeque<GrpcCall>,
    /// Frames owed to the peer (settings, acks, pongs); the connection
    /// writer drains this after every feed.
    control: BytesMut,
    /// In-progress header block awaiting CONTINUATION:
    /// (stream_id, end_stream, fragment).
    pending_block: Option<(u32, bool, BytesMut)>,
    next_stream_id: u32,
    goaway: bool,
}

impl H2Conn {
    pub fn new(role: ConnRole) -> Self {
        Self {
            role,
            // a client never sees a preface from the server
            preface_done: role == ConnRole::Client,
            settings_sent: false,
            hpack_dec: hpack::Decoder::new(),
            streams: HashMap::new(),
            ready: VecDeque::new(),
            control: BytesMut::new(),
            pending_block: None,
            next_stream_id: 1,
            goaway: false,
        }
    }

    /// The peer announced it will accept no more streams.
    pub fn is_goaway(&self) -> bool {
        self.goaway
    }

    /// Frames queued for the peer, if any.
    pub fn take_control(&mut self) -> Option<Bytes> {
        if self.control.is_empty() {
            None
        } else {
            Some(self.control.split().freeze())
        }
    }

    fn complete(&mut self, stream_id: u32, trailers: Vec<(String, String)>) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            trace!("stream {} closed from {:?}", stream_id, stream.phase);
            self.ready.push_back(GrpcCall {
                stream_id,
                headers: stream.headers,
                trailers,
                data: stream.data.freeze(),
                rst: None,
            });
        }
    }

    fn handle_header_block(
        &mut self, stream_id: u32, end_stream: bool, block: &[u8],
    ) -> Result<(), DecodeError> {
        let fields = self.hpack_dec.decode(block).map_err(|_| DecodeError::BadSchema)?;
        match self.streams.get_mut(&stream_id) {
            None => {
                self.streams.insert(
                    stream_id,
                    Stream {
                        phase: StreamPhase::HeadersReceived,
                        headers: fields,
                        data: BytesMut::new(),
                    },
                );
                if end_stream {
                    // headers-only exchange (empty request, trailers-only resp)
                    self.complete(stream_id, Vec::new());
                }
            }
            Some(_) => {
                // a second HEADERS on an open stream is the trailers block
                if !end_stream {
                    return Err(DecodeError::BadSchema);
                }
                self.complete(stream_id, fields);
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, head: FrameHead, payload: Bytes) -> Result<(), DecodeError> {
        if let Some((pending_id, _, _)) = &self.pending_block {
            if head.typ != TYPE_CONTINUATION || head.stream_id != *pending_id {
                return Err(DecodeError::BadSchema);
            }
        }
        match head.typ {
            TYPE_HEADERS => {
                if head.stream_id == 0 {
                    return Err(DecodeError::BadSchema);
                }
                let block = strip_headers_payload(head.flags, payload)
                    .ok_or(DecodeError::BadSchema)?;
                let end_stream = head.flags & FLAG_END_STREAM != 0;
                if head.flags & FLAG_END_HEADERS != 0 {
                    self.handle_header_block(head.stream_id, end_stream, &block)?;
                } else {
                    let mut buf = BytesMut::with_capacity(block.len() * 2);
                    buf.extend_from_slice(&block);
                    self.pending_block = Some((head.stream_id, end_stream, buf));
                }
            }
            TYPE_CONTINUATION => {
                let (stream_id, end_stream, mut buf) =
                    self.pending_block.take().ok_or(DecodeError::BadSchema)?;
                buf.extend_from_slice(&payload);
                if head.flags & FLAG_END_HEADERS != 0 {
                    self.handle_header_block(stream_id, end_stream, &buf)?;
                } else {
                    self.pending_block = Some((stream_id, end_stream, buf));
                }
            }
            TYPE_DATA => {
                let payload =
                    strip_data_payload(head.flags, payload).ok_or(DecodeError::BadSchema)?;
                let stream = self
                    .streams
                    .get_mut(&head.stream_id)
                    .ok_or(DecodeError::BadSchema)?;
                stream.phase = StreamPhase::DataReceived;
                stream.data.extend_from_slice(&payload);
                if head.flags & FLAG_END_STREAM != 0 {
                    self.complete(head.stream_id, Vec::new());
                }
            }
            TYPE_SETTINGS => {
                if head.stream_id != 0 {
                    return Err(DecodeError::BadSchema);
                }
                if head.flags & FLAG_ACK == 0 {
                    if payload.len() % 6 != 0 {
                        return Err(DecodeError::BadSchema);
                    }
                    if !self.settings_sent {
                        settings(&mut self.control);
                        self.settings_sent = true;
                    }
                    settings_ack(&mut self.control);
                }
            }
            TYPE_PING => {
                if head.stream_id != 0 || payload.len() != 8 {
                    return Err(DecodeError::BadSchema);
                }
                if head.flags & FLAG_ACK == 0 {
                    let mut data = [0u8; 8];
                    data.copy_from_slice(&payload);
                    ping_ack(&mut self.control, &data);
                }
            }
            TYPE_RST_STREAM => {
                if payload.len() != 4 {
                    return Err(DecodeError::BadSchema);
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if let Some(stream) = self.streams.remove(&head.stream_id) {
                    self.ready.push_back(GrpcCall {
                        stream_id: head.stream_id,
                        headers: stream.headers,
                        trailers: Vec::new(),
                        data: stream.data.freeze(),
                        rst: Some(code),
                    });
                }
            }
            TYPE_GOAWAY => {
                debug!("h2 goaway received, draining connection");
                self.goaway = true;
            }
            TYPE_PUSH_PROMISE => return Err(DecodeError::BadSchema),
            TYPE_PRIORITY | TYPE_WINDOW_UPDATE => {}
            // unknown frame types are ignored per RFC 7540
            _ => {}
        }
        Ok(())
    }
}

pub struct GrpcCodec;

impl GrpcCodec {
    fn conn_of<'a>(conn: &'a mut ConnState) -> &'a mut H2Conn {
        if conn.h2.is_none() {
            conn.h2 = Some(Box::new(H2Conn::new(conn.role)));
        }
        conn.h2.as_mut().expect("h2 state")
    }

    /// Parse exactly one gRPC-framed message out of the stream data.
    fn deframe_message(data: &Bytes) -> Result<(bool, Bytes), RpcError> {
        if data.is_empty() {
            return Ok((false, Bytes::new()));
        }
        if data.len() < 5 {
            return Err(RpcError::serialization("grpc message frame short"));
        }
        let compressed = data[0] != 0;
        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if data.len() != 5 + len {
            return Err(RpcError::serialization(format!(
                "grpc message length {} does not match data {}",
                len,
                data.len() - 5
            )));
        }
        Ok((compressed, data.slice(5..)))
    }

    fn compress_of(call: &GrpcCall, compressed: bool) -> Result<CompressType, RpcError> {
        if !compressed {
            return Ok(CompressType::None);
        }
        match call.header("grpc-encoding") {
            Some("gzip") => Ok(CompressType::Gzip),
            other => Err(RpcError::serialization(format!(
                "unsupported grpc-encoding {:?}",
                other
            ))),
        }
    }
}

impl ProtocolCodec for GrpcCodec {
    #[inline]
    fn id(&self) -> ProtocolId {
        ProtocolId::Grpc
    }

    fn decode(&self, acc: &mut BufferStore, conn: &mut ConnState) -> Result<RawPacket, DecodeError> {
        let role = conn.role;
        let h2 = Self::conn_of(conn);
        if !h2.preface_done {
            let want = PREFACE.len().min(acc.readable());
            let mut probe = vec![0u8; want];
            acc.peek_into(&mut probe)?;
            if probe[..] != PREFACE[..want] {
                return Err(DecodeError::BadSchema);
            }
            if want < PREFACE.len() {
                return Err(DecodeError::NotEnoughData);
            }
            acc.skip(PREFACE.len())?;
            h2.preface_done = true;
            // the preface pins the connection to this codec before any
            // whole packet exists
            conn.bound_hint = Some(ProtocolId::Grpc);
            let h2 = Self::conn_of(conn);
            if role == ConnRole::Server && !h2.settings_sent {
                settings(&mut h2.control);
                h2.settings_sent = true;
            }
        }
        let h2 = Self::conn_of(conn);
        loop {
            if let Some(call) = h2.ready.pop_front() {
                return Ok(RawPacket::Grpc(call));
            }
            let mut head_buf = [0u8; FRAME_HEAD_LEN];
            acc.peek_into(&mut head_buf)?;
            let head = FrameHead::parse(&head_buf);
            if head.length > MAX_BODY_SIZE {
                return Err(DecodeError::TooBigData);
            }
            if acc.readable() < FRAME_HEAD_LEN + head.length {
                return Err(DecodeError::NotEnoughData);
            }
            acc.skip(FRAME_HEAD_LEN)?;
            let payload = acc.read_retained_slice(head.length)?;
            h2.handle_frame(head, payload)?;
        }
    }

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError> {
        let RawPacket::Grpc(call) = raw else {
            return Err(RpcError::serialization("grpc expects an h2 stream packet"));
        };
        if call.rst.is_some() {
            return Err(RpcError::network(format!("stream {} reset by peer", call.stream_id)));
        }
        let path = call
            .header(":path")
            .ok_or_else(|| RpcError::serialization(":path missing"))?;
        let mut parts = path.trim_matches('/').splitn(2, '/');
        let service = parts.next().unwrap_or("");
        let method = parts.next().unwrap_or("");
        if service.is_empty() || method.is_empty() {
            return Err(RpcError::serialization(format!(
                ":path {:?} does not name /service/method",
                path
            )));
        }
        match call.header("content-type") {
            Some(ct) if ct.starts_with("application/grpc") => {}
            other => {
                return Err(RpcError::serialization(format!(
                    "content-type {:?} is not grpc",
                    other
                )));
            }
        }
        let (compressed, body) = Self::deframe_message(&call.data)?;
        req.compress = Self::compress_of(&call, compressed)?;
        req.log_id = call.stream_id as u64;
        req.service_name = service.to_string();
        req.method = MethodKey::Name(method.to_string());
        req.kv_attachment = call
            .headers
            .iter()
            .filter(|(k, _)| !k.starts_with(':') && k != "content-type" && k != "te")
            .cloned()
            .collect();
        req.body = body;
        Ok(())
    }

    fn decode_response(&self, raw: RawPacket, _conn: &mut ConnState) -> Result<Response, RpcError> {
        let RawPacket::Grpc(call) = raw else {
            return Err(RpcError::serialization("grpc expects an h2 stream packet"));
        };
        if let Some(code) = call.rst {
            return Err(RpcError::network(format!(
                "stream {} reset by peer, h2 error {}",
                call.stream_id, code
            )));
        }
        let mut resp = Response { log_id: call.stream_id as u64, ..Default::default() };
        // trailers-only responses carry status in the single header block
        let status = call
            .trailer("grpc-status")
            .or_else(|| call.header("grpc-status"))
            .and_then(|v| v.parse::<i32>().ok())
            .ok_or_else(|| RpcError {
                kind: polyrpc_core::error::RpcErrorKind::SerializationFailure,
                code: errno::ERESPONSE,
                message: "grpc-status missing".to_string(),
            })?;
        if status != 0 {
            let message = call
                .trailer("grpc-message")
                .or_else(|| call.header("grpc-message"))
                .unwrap_or("")
                .to_string();
            resp.error = Some((status, message));
            return Ok(resp);
        }
        let (compressed, body) = Self::deframe_message(&call.data)?;
        resp.compress = Self::compress_of(&call, compressed)?;
        resp.body = body;
        Ok(resp)
    }

    fn encode_request(&self, req: &mut Request, conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let h2 = Self::conn_of(conn);
        let mut out = BytesMut::new();
        if h2.role == ConnRole::Client && !h2.settings_sent {
            out.extend_from_slice(PREFACE);
            settings(&mut out);
            h2.settings_sent = true;
        }
        let stream_id = h2.next_stream_id;
        h2.next_stream_id += 2;
        // the stream id is the correlation key for this protocol
        req.log_id = stream_id as u64;
        let method_name = match &req.method {
            MethodKey::Name(name) => name.clone(),
            MethodKey::Index(idx) => idx.to_string(),
        };
        let mut fields = vec![
            (":method".to_string(), "POST".to_string()),
            (":scheme".to_string(), "http".to_string()),
            (":path".to_string(), format!("/{}/{}", req.service_name, method_name)),
            (":authority".to_string(), "localhost".to_string()),
            ("te".to_string(), "trailers".to_string()),
            ("content-type".to_string(), "application/grpc".to_string()),
        ];
        for (k, v) in &req.kv_attachment {
            fields.push((k.to_ascii_lowercase(), v.clone()));
        }
        let block = hpack::Encoder::encode(&fields);
        headers(&mut out, stream_id, &block, false);
        grpc_data(&mut out, stream_id, false, &req.body, true);
        Ok(out.freeze())
    }

    fn encode_response(&self, resp: &Response, _conn: &mut ConnState) -> Result<Bytes, RpcError> {
        let stream_id = resp.log_id as u32;
        let mut out = BytesMut::new();
        if let Some((code, text)) = &resp.error {
            // trailers-only response
            let fields = vec![
                (":status".to_string(), "200".to_string()),
                ("content-type".to_string(), "application/grpc".to_string()),
                ("grpc-status".to_string(), code.to_string()),
                ("grpc-message".to_string(), text.clone()),
            ];
            let block = hpack::Encoder::encode(&fields);
            headers(&mut out, stream_id, &block, true);
            return Ok(out.freeze());
        }
        let fields = vec![
            (":status".to_string(), "200".to_string()),
            ("content-type".to_string(), "application/grpc".to_string()),
        ];
        let block = hpack::Encoder::encode(&fields);
        headers(&mut out, stream_id, &block, false);
        grpc_data(&mut out, stream_id, false, &resp.body, false);
        let trailers = vec![("grpc-status".to_string(), "0".to_string())];
        let block = hpack::Encoder::encode(&trailers);
        headers(&mut out, stream_id, &block, true);
        Ok(out.freeze())
    }
}
