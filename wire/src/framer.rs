// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Stream de-framer: turns a byte stream into a sequence of complete
//! Cap'n Proto message frames.
//!
//! Callers feed arbitrarily-sized chunks via [`Framer::push`] and drain
//! complete frames via [`Framer::pop_frame`]. A frame is never handed back
//! until every one of its declared segment bytes has arrived, so a partial
//! read never produces a partial [`crate::value::AnyValue`].

use crate::error::{Error, Result};
use crate::message::{parse_segment_table, ReaderLimits, DEFAULT_READER_LIMITS};

#[derive(Debug)]
pub struct Framer {
    limits: ReaderLimits,
    buf: Vec<u8>,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_READER_LIMITS)
    }
}

impl Framer {
    pub fn new(limits: ReaderLimits) -> Self {
        Self {
            limits,
            buf: Vec::new(),
        }
    }

    /// Appends newly-received bytes to the internal buffer.
    ///
    /// Uses `try_reserve` so that a malicious or buggy peer cannot force an
    /// allocator abort; callers see [`crate::error::ErrorKind::OutOfMemory`]
    /// instead.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf
            .try_reserve(bytes.len())
            .map_err(|e| Error::out_of_memory(e.to_string()))?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Pops the next complete frame out of the buffer, if one has fully
    /// arrived. Returns the raw frame bytes (segment table + body) exactly
    /// as [`crate::message::decode_message`] expects them.
    pub fn pop_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let table = match parse_segment_table(&self.buf, &self.limits)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let frame_len = table.header_len + table.total_body_words() as usize * 8;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        let frame = self.buf[..frame_len].to_vec();
        self.buf.drain(..frame_len);
        Ok(Some(frame))
    }

    /// Discards any buffered partial frame, e.g. after a fatal protocol error.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encode_message;
    use crate::value::AnyValue;

    #[test]
    fn yields_nothing_until_frame_complete() {
        let msg = encode_message(&AnyValue::text("hello")).unwrap();
        let mut framer = Framer::default();
        framer.push(&msg[..msg.len() - 1]).unwrap();
        assert!(framer.pop_frame().unwrap().is_none());
        framer.push(&msg[msg.len() - 1..]).unwrap();
        let frame = framer.pop_frame().unwrap().unwrap();
        assert_eq!(frame, msg);
        assert!(framer.pop_frame().unwrap().is_none());
    }

    #[test]
    fn splits_concatenated_frames() {
        let a = encode_message(&AnyValue::text("a")).unwrap();
        let b = encode_message(&AnyValue::text("bb")).unwrap();
        let mut framer = Framer::default();
        framer.push(&a).unwrap();
        framer.push(&b).unwrap();
        assert_eq!(framer.pop_frame().unwrap().unwrap(), a);
        assert_eq!(framer.pop_frame().unwrap().unwrap(), b);
        assert!(framer.pop_frame().unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_segment_count() {
        let mut framer = Framer::default();
        let mut buf = vec![0u8; 4];
        buf[0..4].copy_from_slice(&600u32.to_le_bytes());
        assert!(framer.push(&buf).is_ok());
        assert!(framer.pop_frame().is_err());
    }
}
