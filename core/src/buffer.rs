use crate::error::DecodeError;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Composite accumulator for one connection.
///
/// Appended chunks are kept as refcounted [Bytes] segments; consuming reads
/// hand out retained slices of the same backing memory, so a decoded packet
/// holds its bytes alive without copying. A slice that happens to span
/// segment boundaries is coalesced lazily, which is the rare path.
///
/// Every read operation fails with [DecodeError::NotEnoughData] when asked
/// for more than is readable, leaving the cursor untouched.
pub struct BufferStore {
    segments: VecDeque<Bytes>,
    readable: usize,
}

impl BufferStore {
    #[inline]
    pub fn new() -> Self {
        Self { segments: VecDeque::new(), readable: 0 }
    }

    /// Append one chunk as read from the transport. Empty chunks are dropped.
    #[inline]
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.readable += chunk.len();
        self.segments.push_back(chunk);
    }

    #[inline]
    pub fn readable(&self) -> usize {
        self.readable
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable == 0
    }

    /// Non-consuming copy of the next `dst.len()` bytes, for fixed wire heads.
    pub fn peek_into(&self, dst: &mut [u8]) -> Result<(), DecodeError> {
        if dst.len() > self.readable {
            return Err(DecodeError::NotEnoughData);
        }
        let mut filled = 0;
        for seg in self.segments.iter() {
            if filled == dst.len() {
                break;
            }
            let n = seg.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&seg[..n]);
            filled += n;
        }
        Ok(())
    }

    /// Non-consuming retained slice starting at `offset`.
    ///
    /// Zero-copy when the range lies within one segment.
    pub fn retained_slice(&self, offset: usize, n: usize) -> Result<Bytes, DecodeError> {
        if offset + n > self.readable {
            return Err(DecodeError::NotEnoughData);
        }
        if n == 0 {
            return Ok(Bytes::new());
        }
        let mut skip = offset;
        let mut iter = self.segments.iter();
        // find the segment holding the first byte
        let mut seg = loop {
            let s = iter.next().expect("offset within readable");
            if skip < s.len() {
                break s;
            }
            skip -= s.len();
        };
        if skip + n <= seg.len() {
            return Ok(seg.slice(skip..skip + n));
        }
        let mut out = BytesMut::with_capacity(n);
        let mut remain = n;
        loop {
            let take = (seg.len() - skip).min(remain);
            out.extend_from_slice(&seg[skip..skip + take]);
            remain -= take;
            if remain == 0 {
                return Ok(out.freeze());
            }
            skip = 0;
            seg = iter.next().expect("range within readable");
        }
    }

    /// Consume `n` bytes, returning them as a retained slice.
    pub fn read_retained_slice(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        if n > self.readable {
            return Err(DecodeError::NotEnoughData);
        }
        if n == 0 {
            return Ok(Bytes::new());
        }
        let front_len = self.segments[0].len();
        if n < front_len {
            let out = self.segments[0].split_to(n);
            self.readable -= n;
            return Ok(out);
        }
        if n == front_len {
            self.readable -= n;
            return Ok(self.segments.pop_front().expect("front exists"));
        }
        let mut out = BytesMut::with_capacity(n);
        let mut remain = n;
        while remain > 0 {
            let front = &mut self.segments[0];
            if remain < front.len() {
                out.extend_from_slice(&front.split_to(remain));
                remain = 0;
            } else {
                remain -= front.len();
                out.extend_from_slice(&self.segments.pop_front().expect("front exists"));
            }
        }
        self.readable -= n;
        Ok(out.freeze())
    }

    /// Consume and discard `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if n > self.readable {
            return Err(DecodeError::NotEnoughData);
        }
        let mut remain = n;
        while remain > 0 {
            let front = &mut self.segments[0];
            if remain < front.len() {
                front.advance(remain);
                break;
            }
            remain -= front.len();
            self.segments.pop_front();
        }
        self.readable -= n;
        Ok(())
    }

    /// A contiguous view of everything readable, coalescing segments if
    /// needed. Non-consuming; used by text protocols whose head has no
    /// length prefix.
    pub fn contiguous(&mut self) -> &[u8] {
        if self.segments.len() > 1 {
            let mut merged = BytesMut::with_capacity(self.readable);
            for seg in self.segments.drain(..) {
                merged.extend_from_slice(&seg);
            }
            self.segments.push_back(merged.freeze());
        }
        match self.segments.front() {
            Some(seg) => seg,
            None => &[],
        }
    }
}

impl Default for BufferStore {
    fn default() -> Self {
        Self::new()
    }
}
