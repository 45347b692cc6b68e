//! HPACK (RFC 7541) header field decoding and encoding.
//!
//! The decoder supports the full wire surface a peer may send: indexed
//! fields against the static and dynamic tables, all three literal forms,
//! dynamic-table size updates, and Huffman-coded strings. The encoder emits
//! literals without indexing and raw strings, which every decoder accepts.

use std::collections::VecDeque;
use std::sync::OnceLock;

const DEFAULT_TABLE_SIZE: usize = 4096;
/// Per-entry overhead defined by RFC 7541 §4.1.
const ENTRY_OVERHEAD: usize = 32;

/// RFC 7541 Appendix A.
static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// RFC 7541 Appendix B: (code, bit length) per symbol, 256 plus EOS.
#[rustfmt::skip]
static HUFFMAN_TABLE: [(u32, u8); 257] = [
    (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28),
    (0xfffffe4, 28), (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28),
    (0xfffffe8, 28), (0xffffea, 24), (0x3ffffffc, 30), (0xfffffe9, 28),
    (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28), (0xfffffec, 28),
    (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
    (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28),
    (0xffffff4, 28), (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28),
    (0xffffff8, 28), (0xffffff9, 28), (0xffffffa, 28), (0xffffffb, 28),
    (0x14, 6), (0x3f8, 10), (0x3f9, 10), (0xffa, 12),
    (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
    (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11),
    (0xfa, 8), (0x16, 6), (0x17, 6), (0x18, 6),
    (0x0, 5), (0x1, 5), (0x2, 5), (0x19, 6),
    (0x1a, 6), (0x1b, 6), (0x1c, 6), (0x1d, 6),
    (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
    (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10),
    (0x1ffa, 13), (0x21, 6), (0x5d, 7), (0x5e, 7),
    (0x5f, 7), (0x60, 7), (0x61, 7), (0x62, 7),
    (0x63, 7), (0x64, 7), (0x65, 7), (0x66, 7),
    (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
    (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7),
    (0x6f, 7), (0x70, 7), (0x71, 7), (0x72, 7),
    (0xfc, 8), (0x73, 7), (0xfd, 8), (0x1ffb, 13),
    (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14), (0x22, 6),
    (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
    (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6),
    (0x27, 6), (0x6, 5), (0x74, 7), (0x75, 7),
    (0x28, 6), (0x29, 6), (0x2a, 6), (0x7, 5),
    (0x2b, 6), (0x76, 7), (0x2c, 6), (0x8, 5),
    (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
    (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15),
    (0x7fc, 11), (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28),
    (0xfffe6, 20), (0x3fffd2, 22), (0xfffe7, 20), (0xfffe8, 20),
    (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22), (0x7fffd9, 23),
    (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
    (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23),
    (0xffffec, 24), (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23),
    (0xffffee, 24), (0x7fffe1, 23), (0x7fffe2, 23), (0x7fffe3, 23),
    (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22), (0x7fffe5, 23),
    (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
    (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22),
    (0x3fffdc, 22), (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21),
    (0x7fffea, 23), (0x3fffdd, 22), (0x3fffde, 22), (0xfffff0, 24),
    (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23), (0x7fffec, 23),
    (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
    (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23),
    (0xfffea, 20), (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22),
    (0x7ffff0, 23), (0x3fffe5, 22), (0x3fffe6, 22), (0x7ffff1, 23),
    (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20), (0x7fff1, 19),
    (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
    (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27),
    (0x7ffffdf, 27), (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25),
    (0x7fff2, 19), (0x1fffe3, 21), (0x3ffffe6, 26), (0x7ffffe0, 27),
    (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27), (0xfffff2, 24),
    (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
    (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27),
    (0xfffec, 20), (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21),
    (0x3fffe9, 22), (0x1fffe7, 21), (0x1fffe8, 21), (0x7ffff3, 23),
    (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25), (0x1ffffef, 25),
    (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
    (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26),
    (0x7ffffe7, 27), (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27),
    (0x7ffffeb, 27), (0xffffffe, 28), (0x7ffffec, 27), (0x7ffffed, 27),
    (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27), (0x3ffffee, 26),
    (0x3fffffff, 30),
];

const EOS: u16 = 256;

/// Binary decode tree over the Huffman codes; node 0 is the root.
struct HuffmanTree {
    // children[bit] per node; u16::MAX marks absent
    children: Vec<[u16; 2]>,
    symbol: Vec<u16>,
}

fn huffman_tree() -> &'static HuffmanTree {
    static TREE: OnceLock<HuffmanTree> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut tree =
            HuffmanTree { children: vec![[u16::MAX; 2]], symbol: vec![u16::MAX] };
        for (sym, (code, bits)) in HUFFMAN_TABLE.iter().enumerate() {
            let mut node = 0usize;
            for i in (0..*bits).rev() {
                let bit = ((code >> i) & 1) as usize;
                if tree.children[node][bit] == u16::MAX {
                    tree.children.push([u16::MAX; 2]);
                    tree.symbol.push(u16::MAX);
                    let next = (tree.children.len() - 1) as u16;
                    tree.children[node][bit] = next;
                }
                node = tree.children[node][bit] as usize;
            }
            tree.symbol[node] = sym as u16;
        }
        tree
    })
}

pub fn huffman_decode(data: &[u8]) -> Result<Vec<u8>, ()> {
    let tree = huffman_tree();
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut node = 0usize;
    let mut depth = 0u8;
    for byte in data {
        for i in (0..8).rev() {
            let bit = ((byte >> i) & 1) as usize;
            let next = tree.children[node][bit];
            if next == u16::MAX {
                return Err(());
            }
            node = next as usize;
            depth += 1;
            let sym = tree.symbol[node];
            if sym != u16::MAX {
                if sym == EOS {
                    // EOS inside the string is a coding error
                    return Err(());
                }
                out.push(sym as u8);
                node = 0;
                depth = 0;
            }
        }
    }
    // trailing padding must be a prefix of EOS (all ones) shorter than a byte
    if depth >= 8 {
        return Err(());
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HpackError;

/// Decode a variable-length integer with an n-bit prefix (RFC 7541 §5.1).
fn decode_int(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    if buf.is_empty() {
        return Err(HpackError);
    }
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (buf[0] as usize) & max_prefix;
    if value < max_prefix {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, b) in buf[1..].iter().enumerate() {
        value = value
            .checked_add(((b & 0x7f) as usize) << shift)
            .ok_or(HpackError)?;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
        if shift > 28 {
            return Err(HpackError);
        }
    }
    Err(HpackError)
}

fn encode_int(out: &mut Vec<u8>, mut value: usize, prefix_bits: u8, first_byte: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.push(first_byte | value as u8);
        return;
    }
    out.push(first_byte | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn decode_string(buf: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    if buf.is_empty() {
        return Err(HpackError);
    }
    let huffman = buf[0] & 0x80 != 0;
    let (len, consumed) = decode_int(buf, 7)?;
    if buf.len() < consumed + len {
        return Err(HpackError);
    }
    let raw = &buf[consumed..consumed + len];
    let value =
        if huffman { huffman_decode(raw).map_err(|_| HpackError)? } else { raw.to_vec() };
    Ok((value, consumed + len))
}

pub struct Decoder {
    dynamic: VecDeque<(Vec<u8>, Vec<u8>)>,
    max_size: usize,
    size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self { dynamic: VecDeque::new(), max_size: DEFAULT_TABLE_SIZE, size: 0 }
    }

    fn lookup(&self, index: usize) -> Result<(Vec<u8>, Vec<u8>), HpackError> {
        if index == 0 {
            return Err(HpackError);
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        self.dynamic.get(index - STATIC_TABLE.len() - 1).cloned().ok_or(HpackError)
    }

    fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;
        self.dynamic.push_front((name, value));
        self.size += entry_size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            if let Some((n, v)) = self.dynamic.pop_back() {
                self.size -= n.len() + v.len() + ENTRY_OVERHEAD;
            } else {
                self.size = 0;
            }
        }
    }

    /// Decode one complete header block.
    pub fn decode(&mut self, mut buf: &[u8]) -> Result<Vec<(String, String)>, HpackError> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            let b = buf[0];
            if b & 0x80 != 0 {
                // indexed field
                let (index, n) = decode_int(buf, 7)?;
                buf = &buf[n..];
                let (name, value) = self.lookup(index)?;
                out.push(to_pair(name, value)?);
            } else if b & 0xc0 == 0x40 {
                // literal with incremental indexing
                let (name, value, n) = self.decode_literal(buf, 6)?;
                buf = &buf[n..];
                self.insert(name.clone(), value.clone());
                out.push(to_pair(name, value)?);
            } else if b & 0xe0 == 0x20 {
                // dynamic table size update
                let (size, n) = decode_int(buf, 5)?;
                buf = &buf[n..];
                if size > DEFAULT_TABLE_SIZE {
                    return Err(HpackError);
                }
                self.max_size = size;
                self.evict();
            } else {
                // literal without indexing (0000) or never indexed (0001)
                let (name, value, n) = self.decode_literal(buf, 4)?;
                buf = &buf[n..];
                out.push(to_pair(name, value)?);
            }
        }
        Ok(out)
    }

    fn decode_literal(
        &self, buf: &[u8], prefix_bits: u8,
    ) -> Result<(Vec<u8>, Vec<u8>, usize), HpackError> {
        let (name_index, mut pos) = decode_int(buf, prefix_bits)?;
        let name = if name_index == 0 {
            let (name, n) = decode_string(&buf[pos..])?;
            pos += n;
            name
        } else {
            self.lookup(name_index)?.0
        };
        let (value, n) = decode_string(&buf[pos..])?;
        pos += n;
        Ok((name, value, pos))
    }
}

fn to_pair(name: Vec<u8>, value: Vec<u8>) -> Result<(String, String), HpackError> {
    Ok((
        String::from_utf8(name).map_err(|_| HpackError)?,
        String::from_utf8(value).map_err(|_| HpackError)?,
    ))
}

/// Stateless encoder: every field is a literal without indexing with raw
/// strings, the representation every peer must accept.
pub struct Encoder;

impl Encoder {
    pub fn encode(headers: &[(String, String)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        for (name, value) in headers {
            // representation byte: literal without indexing, name inline
            out.push(0x00);
            encode_int(&mut out, name.len(), 7, 0x00);
            out.extend_from_slice(name.as_bytes());
            encode_int(&mut out, value.len(), 7, 0x00);
            out.extend_from_slice(value.as_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_boundaries() {
        // RFC 7541 C.1: 1337 with 5-bit prefix = [0x1f, 0x9a, 0x0a]
        let mut out = Vec::new();
        encode_int(&mut out, 1337, 5, 0);
        assert_eq!(out, vec![0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_int(&out, 5).expect("decode"), (1337, 3));
        let mut out = Vec::new();
        encode_int(&mut out, 10, 5, 0);
        assert_eq!(out, vec![0x0a]);
    }

    #[test]
    fn test_huffman_known_vector() {
        // RFC 7541 C.4.1: "www.example.com"
        let coded = [0xf1u8, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff];
        let plain = huffman_decode(&coded).expect("huffman");
        assert_eq!(plain, b"www.example.com");
    }

    #[test]
    fn test_literal_roundtrip_via_encoder() {
        let headers = vec![
            (":method".to_string(), "POST".to_string()),
            (":path".to_string(), "/example_for_cpp.EchoService/Echo".to_string()),
            ("content-type".to_string(), "application/grpc".to_string()),
            ("te".to_string(), "trailers".to_string()),
        ];
        let block = Encoder::encode(&headers);
        let mut dec = Decoder::new();
        let out = dec.decode(&block).expect("decode");
        assert_eq!(out, headers);
    }

    #[test]
    fn test_indexed_static_fields() {
        // index 3 = :method POST, index 8 = :status 200
        let block = [0x83u8, 0x88];
        let mut dec = Decoder::new();
        let out = dec.decode(&block).expect("decode");
        assert_eq!(
            out,
            vec![
                (":method".to_string(), "POST".to_string()),
                (":status".to_string(), "200".to_string()),
            ]
        );
    }

    #[test]
    fn test_incremental_indexing_grows_table() {
        // literal with incremental indexing, new name "x-a": "1",
        // then indexed 62 referencing it
        let mut block = vec![0x40u8];
        block.push(3);
        block.extend_from_slice(b"x-a");
        block.push(1);
        block.extend_from_slice(b"1");
        block.push(0xbe); // indexed, 62
        let mut dec = Decoder::new();
        let out = dec.decode(&block).expect("decode");
        assert_eq!(out[0], out[1]);
        assert_eq!(out[0], ("x-a".to_string(), "1".to_string()));
    }

    #[test]
    fn test_bad_index_rejected() {
        let mut dec = Decoder::new();
        assert!(dec.decode(&[0xff, 0xff, 0xff, 0xff, 0x7f]).is_err());
    }
}
