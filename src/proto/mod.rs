//! Wire protocol codecs and the contract they share with the framing engine.
//!
//! Codecs are stateless and reentrant; per-connection protocol state (the
//! HTTP/2 connection once bound to gRPC) lives in [ConnState], owned by the
//! framing engine. `decode` pulls exactly one whole packet from the
//! accumulator or classifies why it cannot.

use bytes::Bytes;
use polyrpc_core::error::{DecodeError, RpcError};
use polyrpc_core::{BufferStore, CompressType, MAX_BODY_SIZE};
use std::fmt;
use std::time::Duration;

pub mod baidu;
pub mod grpc;
pub mod http;
pub mod hulu;
pub mod nshead;
pub mod push;
pub mod sofa;

pub use push::{SpHead, SpType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    BaiduStd,
    Hulu,
    Sofa,
    NsHead,
    ServerPush,
    Http,
    Grpc,
}

/// How a protocol addresses the target method.
///
/// Baidu-std, SoFa and HTTP carry the method name; Hulu carries the proto
/// method sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodKey {
    Name(String),
    Index(i32),
}

impl Default for MethodKey {
    fn default() -> Self {
        MethodKey::Name(String::new())
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Name(s) => write!(f, "{}", s),
            Self::Index(i) => write!(f, "#{}", i),
        }
    }
}

/// Fixed NSHead identity carried by a method registered for that protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NsHeadInfo {
    pub id: u16,
    pub version: u16,
    pub provider: [u8; 16],
}

/// One decoded request, protocol-independent.
///
/// `body` is the serialized (and possibly compressed) message; typed parsing
/// happens in the registered invoker. `attachment` holds a retained slice of
/// the accumulator whose ownership transferred here during decode.
#[derive(Default)]
pub struct Request {
    pub log_id: u64,
    pub service_name: String,
    pub method: MethodKey,
    pub compress: CompressType,
    pub body: Bytes,
    pub attachment: Option<Bytes>,
    pub kv_attachment: Vec<(String, String)>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub trace_id: i64,
    pub span_id: i64,
    pub parent_span_id: i64,
    /// Set on packets travelling under a server-push sub-header.
    pub sp_head: Option<SpHead>,
    /// Set on NSHead connections where the wire carries no method key.
    pub ns_head: Option<NsHeadInfo>,
    /// JSON body marker from the HTTP codec; selects the parse path.
    pub json_body: bool,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "req(log_id={}, service={}, method={}, body={}B)",
            self.log_id,
            self.service_name,
            self.method,
            self.body.len()
        )
    }
}

/// One response, protocol-independent. `error` carries the wire error code
/// and text; `error == None` encodes success.
#[derive(Default)]
pub struct Response {
    pub log_id: u64,
    pub compress: CompressType,
    pub body: Bytes,
    pub error: Option<(i32, String)>,
    pub attachment: Option<Bytes>,
    pub sp_head: Option<SpHead>,
    pub json_body: bool,
}

impl Response {
    #[inline]
    pub fn from_error(log_id: u64, err: &RpcError) -> Self {
        Self { log_id, error: Some((err.code, err.message.clone())), ..Default::default() }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            Some((code, text)) => {
                write!(f, "resp(log_id={}, err={} {:?})", self.log_id, code, text)
            }
            None => write!(f, "resp(log_id={}, body={}B)", self.log_id, self.body.len()),
        }
    }
}

/// Whole packet handed from `decode` to `decode_request`/`decode_response`.
///
/// Meta and body are retained slices of the accumulator; each variant is
/// consumed exactly once and releases its refcounts on drop.
pub enum RawPacket {
    /// Length-prefixed binary family and NSHead: opaque meta block + body.
    Framed { meta: Bytes, body: Bytes },
    /// A framed packet travelling under a server-push sub-header.
    Push { head: SpHead, inner: Box<RawPacket> },
    Http(http::HttpPacket),
    Grpc(grpc::GrpcCall),
}

impl fmt::Debug for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Framed { meta, body } => {
                write!(f, "framed(meta={}B, body={}B)", meta.len(), body.len())
            }
            Self::Push { head, inner } => write!(f, "push({:?}, {:?})", head, inner),
            Self::Http(p) => write!(f, "{:?}", p),
            Self::Grpc(c) => write!(f, "{:?}", c),
        }
    }
}

/// Which end of the connection this decoder serves; text and h2 protocols
/// parse different packet shapes per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Client,
    Server,
}

/// Per-connection protocol state owned by the framing engine.
///
/// Codec objects stay stateless; anything a protocol must remember between
/// packets on one connection lives here.
pub struct ConnState {
    pub role: ConnRole,
    /// HTTP/2 connection state, present once bound to gRPC.
    pub h2: Option<Box<grpc::H2Conn>>,
    /// Set by a codec that latched the connection mid-decode (gRPC pins the
    /// connection at the preface, before the first whole packet exists).
    pub bound_hint: Option<ProtocolId>,
}

impl ConnState {
    #[inline]
    pub fn new(role: ConnRole) -> Self {
        Self { role, h2: None, bound_hint: None }
    }
}

/// Contract shared by every wire format.
///
/// `decode` must be prefix-safe: a legitimate short read returns
/// `NotEnoughData` with the cursor preserved, never `BadSchema`.
pub trait ProtocolCodec: Send + Sync {
    fn id(&self) -> ProtocolId;

    fn decode(&self, acc: &mut BufferStore, conn: &mut ConnState)
        -> Result<RawPacket, DecodeError>;

    fn decode_request(&self, raw: RawPacket, req: &mut Request) -> Result<(), RpcError>;

    fn decode_response(&self, raw: RawPacket, conn: &mut ConnState) -> Result<Response, RpcError>;

    /// May assign protocol-owned correlation state (gRPC writes the stream
    /// id back into `req.log_id`).
    fn encode_request(&self, req: &mut Request, conn: &mut ConnState) -> Result<Bytes, RpcError>;

    fn encode_response(&self, resp: &Response, conn: &mut ConnState) -> Result<Bytes, RpcError>;
}

/// Candidate order for protocol auto-detection on an unbound connection:
/// most specific binary magics first, then the HTTP/1.1 request-line
/// heuristic, then the HTTP/2 preface.
pub fn detect_candidates() -> &'static [&'static dyn ProtocolCodec] {
    static CANDIDATES: [&dyn ProtocolCodec; 7] = [
        &baidu::BaiduStdCodec,
        &hulu::HuluCodec,
        &sofa::SofaCodec,
        &nshead::NsHeadCodec,
        &push::SERVER_PUSH_CODEC,
        &http::HttpCodec,
        &grpc::GrpcCodec,
    ];
    &CANDIDATES
}

/// Resolve a bound protocol id back to its codec object.
pub fn codec_of(id: ProtocolId) -> &'static dyn ProtocolCodec {
    match id {
        ProtocolId::BaiduStd => &baidu::BaiduStdCodec,
        ProtocolId::Hulu => &hulu::HuluCodec,
        ProtocolId::Sofa => &sofa::SofaCodec,
        ProtocolId::NsHead => &nshead::NsHeadCodec,
        ProtocolId::ServerPush => &push::SERVER_PUSH_CODEC,
        ProtocolId::Http => &http::HttpCodec,
        ProtocolId::Grpc => &grpc::GrpcCodec,
    }
}

/// Shared framing for the length-prefixed binary family:
/// `[MAGIC(4)][body_size(u32)][meta_size(u32)][meta][body]`.
///
/// Hulu and SoFa read the two size fields little-endian, Baidu-std
/// big-endian; the asymmetry is an interoperability contract.
pub(crate) fn decode_length_prefixed(
    acc: &mut BufferStore, magic: &[u8; 4], little_endian: bool,
) -> Result<RawPacket, DecodeError> {
    const FIXED_LEN: usize = 12;
    let mut head = [0u8; FIXED_LEN];
    acc.peek_into(&mut head)?;
    if &head[..4] != magic {
        return Err(DecodeError::BadSchema);
    }
    let (body_size, meta_size) = if little_endian {
        (
            u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize,
            u32::from_le_bytes([head[8], head[9], head[10], head[11]]) as usize,
        )
    } else {
        (
            u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize,
            u32::from_be_bytes([head[8], head[9], head[10], head[11]]) as usize,
        )
    };
    if body_size > MAX_BODY_SIZE {
        return Err(DecodeError::TooBigData);
    }
    if meta_size > body_size {
        return Err(DecodeError::BadSchema);
    }
    if acc.readable() < FIXED_LEN + body_size {
        return Err(DecodeError::NotEnoughData);
    }
    acc.skip(FIXED_LEN)?;
    let meta = acc.read_retained_slice(meta_size)?;
    let body = acc.read_retained_slice(body_size - meta_size)?;
    Ok(RawPacket::Framed { meta, body })
}

/// Encode-side companion of [decode_length_prefixed].
pub(crate) fn encode_length_prefixed(
    magic: &[u8; 4], little_endian: bool, meta: &[u8], body: &[u8], attachment: Option<&[u8]>,
) -> Bytes {
    let att_len = attachment.map(|a| a.len()).unwrap_or(0);
    let body_size = (meta.len() + body.len() + att_len) as u32;
    let meta_size = meta.len() as u32;
    let mut out = bytes::BytesMut::with_capacity(12 + body_size as usize);
    out.extend_from_slice(magic);
    if little_endian {
        out.extend_from_slice(&body_size.to_le_bytes());
        out.extend_from_slice(&meta_size.to_le_bytes());
    } else {
        out.extend_from_slice(&body_size.to_be_bytes());
        out.extend_from_slice(&meta_size.to_be_bytes());
    }
    out.extend_from_slice(meta);
    out.extend_from_slice(body);
    if let Some(att) = attachment {
        out.extend_from_slice(att);
    }
    out.freeze()
}

/// Split a framed body at the message/attachment boundary.
///
/// `msg_size` is the message length (the meta's `user_message_size`
/// convention); the remainder transfers out as the attachment slice. The
/// caller hands both on and keeps no reference, so each refcount releases
/// exactly once.
pub(crate) fn split_attachment(
    body: Bytes, msg_size: usize,
) -> Result<(Bytes, Option<Bytes>), RpcError> {
    if msg_size == 0 {
        return Ok((body, None));
    }
    if msg_size > body.len() {
        return Err(RpcError::serialization(format!(
            "user_message_size {} exceeds body {}",
            msg_size,
            body.len()
        )));
    }
    if msg_size == body.len() {
        return Ok((body, None));
    }
    let msg = body.slice(..msg_size);
    let att = body.slice(msg_size..);
    Ok((msg, Some(att)))
}
