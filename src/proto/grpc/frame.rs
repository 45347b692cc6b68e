//! HTTP/2 frame layer: the 9-byte frame header, the connection preface, and
//! builders for the frames this codec originates.

use bytes::{BufMut, Bytes, BytesMut};

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const FRAME_HEAD_LEN: usize = 9;
/// SETTINGS_MAX_FRAME_SIZE floor; always legal to send.
pub const MAX_SEND_FRAME: usize = 16_384;

pub const TYPE_DATA: u8 = 0x0;
pub const TYPE_HEADERS: u8 = 0x1;
pub const TYPE_PRIORITY: u8 = 0x2;
pub const TYPE_RST_STREAM: u8 = 0x3;
pub const TYPE_SETTINGS: u8 = 0x4;
pub const TYPE_PUSH_PROMISE: u8 = 0x5;
pub const TYPE_PING: u8 = 0x6;
pub const TYPE_GOAWAY: u8 = 0x7;
pub const TYPE_WINDOW_UPDATE: u8 = 0x8;
pub const TYPE_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

#[derive(Debug, Clone, Copy)]
pub struct FrameHead {
    pub length: usize,
    pub typ: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHead {
    pub fn parse(buf: &[u8; FRAME_HEAD_LEN]) -> Self {
        Self {
            length: ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize,
            typ: buf[3],
            flags: buf[4],
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        }
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8((self.length >> 16) as u8);
        out.put_u8((self.length >> 8) as u8);
        out.put_u8(self.length as u8);
        out.put_u8(self.typ);
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

fn put_frame(out: &mut BytesMut, typ: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    FrameHead { length: payload.len(), typ, flags, stream_id }.write(out);
    out.extend_from_slice(payload);
}

/// Empty SETTINGS we announce on connection start.
pub fn settings(out: &mut BytesMut) {
    put_frame(out, TYPE_SETTINGS, 0, 0, &[]);
}

pub fn settings_ack(out: &mut BytesMut) {
    put_frame(out, TYPE_SETTINGS, FLAG_ACK, 0, &[]);
}

pub fn ping_ack(out: &mut BytesMut, payload: &[u8; 8]) {
    put_frame(out, TYPE_PING, FLAG_ACK, 0, payload);
}

pub fn rst_stream(out: &mut BytesMut, stream_id: u32, error_code: u32) {
    put_frame(out, TYPE_RST_STREAM, 0, stream_id, &error_code.to_be_bytes());
}

/// A header block as HEADERS plus CONTINUATION when it exceeds the frame
/// cap; `end_stream` marks trailers.
pub fn headers(out: &mut BytesMut, stream_id: u32, block: &[u8], end_stream: bool) {
    let mut flags = if end_stream { FLAG_END_STREAM } else { 0 };
    if block.len() <= MAX_SEND_FRAME {
        put_frame(out, TYPE_HEADERS, flags | FLAG_END_HEADERS, stream_id, block);
        return;
    }
    let mut chunks = block.chunks(MAX_SEND_FRAME).peekable();
    let first = chunks.next().expect("block not empty");
    put_frame(out, TYPE_HEADERS, flags, stream_id, first);
    flags = 0;
    while let Some(chunk) = chunks.next() {
        let end = if chunks.peek().is_none() { FLAG_END_HEADERS } else { 0 };
        put_frame(out, TYPE_CONTINUATION, flags | end, stream_id, chunk);
    }
}

/// gRPC message framing inside DATA: `[compressed: u8][len: u32 BE][payload]`,
/// split across DATA frames as needed.
pub fn grpc_data(out: &mut BytesMut, stream_id: u32, compressed: bool, msg: &[u8], end_stream: bool) {
    let mut framed = BytesMut::with_capacity(5 + msg.len());
    framed.put_u8(compressed as u8);
    framed.put_u32(msg.len() as u32);
    framed.extend_from_slice(msg);
    let framed = framed.freeze();
    put_data(out, stream_id, &framed, end_stream);
}

fn put_data(out: &mut BytesMut, stream_id: u32, payload: &Bytes, end_stream: bool) {
    if payload.len() <= MAX_SEND_FRAME {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        put_frame(out, TYPE_DATA, flags, stream_id, payload);
        return;
    }
    let mut chunks = payload.chunks(MAX_SEND_FRAME).peekable();
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let flags = if last && end_stream { FLAG_END_STREAM } else { 0 };
        put_frame(out, TYPE_DATA, flags, stream_id, chunk);
    }
}

/// Strip padding and the optional priority block from a HEADERS payload.
pub fn strip_headers_payload(flags: u8, payload: Bytes) -> Option<Bytes> {
    let mut start = 0usize;
    let mut end = payload.len();
    if flags & FLAG_PADDED != 0 {
        if payload.is_empty() {
            return None;
        }
        let pad = payload[0] as usize;
        start += 1;
        if pad + start > end {
            return None;
        }
        end -= pad;
    }
    if flags & FLAG_PRIORITY != 0 {
        if start + 5 > end {
            return None;
        }
        start += 5;
    }
    Some(payload.slice(start..end))
}

/// Strip padding from a DATA payload.
pub fn strip_data_payload(flags: u8, payload: Bytes) -> Option<Bytes> {
    if flags & FLAG_PADDED == 0 {
        return Some(payload);
    }
    if payload.is_empty() {
        return None;
    }
    let pad = payload[0] as usize;
    if pad + 1 > payload.len() {
        return None;
    }
    Some(payload.slice(1..payload.len() - pad))
}
