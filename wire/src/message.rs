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

//! Segment framing and the struct/list/far/capability pointer resolver.
//!
//! Encodes and decodes a full Cap'n Proto stream frame: the segment table,
//! followed by one or more segments of 8-byte words. [`crate::framer`] only
//! needs [`parse_segment_table`] to know where a frame ends; this module
//! additionally resolves the root pointer into an owned [`AnyValue`] tree.

use crate::error::{Error, Result};
use crate::pointer;
use crate::value::{AnyValue, ListValue, StructValue};

/// Limits enforced while decoding a message, mirroring `capnp::message::ReaderOptions`.
#[derive(Debug, Clone, Copy)]
pub struct ReaderLimits {
    pub max_segments: usize,
    pub max_total_words: u64,
    pub nesting_limit: u32,
}

pub const DEFAULT_READER_LIMITS: ReaderLimits = ReaderLimits {
    max_segments: 512,
    max_total_words: 8 * 1024 * 1024,
    nesting_limit: crate::value::DEFAULT_DEPTH_LIMIT,
};

impl Default for ReaderLimits {
    fn default() -> Self {
        DEFAULT_READER_LIMITS
    }
}

pub struct SegmentTable {
    /// Total bytes occupied by the segment-count word, the per-segment size
    /// words, and any alignment padding.
    pub header_len: usize,
    pub segment_word_counts: Vec<u32>,
}

impl SegmentTable {
    pub fn total_body_words(&self) -> u64 {
        self.segment_word_counts.iter().map(|&w| w as u64).sum()
    }
}

/// Parses the segment table at the front of `buf`. Returns `Ok(None)` if
/// `buf` does not yet contain enough bytes to know the table's length —
/// callers should wait for more data rather than treating this as an error.
pub fn parse_segment_table(buf: &[u8], limits: &ReaderLimits) -> Result<Option<SegmentTable>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let segment_count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as u64 + 1;
    if segment_count as usize > limits.max_segments {
        return Err(Error::frame_too_large(format!(
            "segment_count {segment_count} exceeds limit {}",
            limits.max_segments
        )));
    }
    let segment_count = segment_count as usize;
    let table_words32 = 1 + segment_count;
    let header_len = (table_words32 + (table_words32 % 2)) * 4;
    if buf.len() < header_len {
        return Ok(None);
    }
    let mut segment_word_counts = Vec::with_capacity(segment_count);
    for i in 0..segment_count {
        let start = 4 + i * 4;
        let words = u32::from_le_bytes(buf[start..start + 4].try_into().unwrap());
        segment_word_counts.push(words);
    }
    let table = SegmentTable {
        header_len,
        segment_word_counts,
    };
    if table.total_body_words() > limits.max_total_words {
        return Err(Error::frame_too_large(format!(
            "body of {} words exceeds limit {}",
            table.total_body_words(),
            limits.max_total_words
        )));
    }
    Ok(Some(table))
}

fn bytes_to_segments(body: &[u8], segment_word_counts: &[u32]) -> Result<Vec<Vec<u64>>> {
    let mut segments = Vec::with_capacity(segment_word_counts.len());
    let mut offset = 0usize;
    for &words in segment_word_counts {
        let byte_len = words as usize * 8;
        let chunk = body
            .get(offset..offset + byte_len)
            .ok_or_else(|| Error::truncated_message("segment body shorter than declared size"))?;
        let mut seg = Vec::with_capacity(words as usize);
        for w in chunk.chunks_exact(8) {
            seg.push(u64::from_le_bytes(w.try_into().unwrap()));
        }
        segments.push(seg);
        offset += byte_len;
    }
    Ok(segments)
}

fn segments_to_bytes(table_header: &[u8], segments: &[Vec<u64>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(table_header.len() + segments.iter().map(|s| s.len() * 8).sum::<usize>());
    out.extend_from_slice(table_header);
    for seg in segments {
        for w in seg {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }
    out
}

/// Decodes a complete on-wire frame (segment table + body) into an owned
/// pointer tree rooted at the first word of segment 0.
pub fn decode_message(frame: &[u8]) -> Result<AnyValue> {
    decode_message_with_limits(frame, &DEFAULT_READER_LIMITS)
}

pub fn decode_message_with_limits(frame: &[u8], limits: &ReaderLimits) -> Result<AnyValue> {
    let table = parse_segment_table(frame, limits)?
        .ok_or_else(|| Error::truncated_message("incomplete segment table"))?;
    let body = &frame[table.header_len..];
    let segments = bytes_to_segments(body, &table.segment_word_counts)?;
    if segments.is_empty() || segments[0].is_empty() {
        return Ok(AnyValue::Null);
    }
    let mut resolver = Resolver {
        segments: &segments,
    };
    resolver.decode_pointer_at(0, 0, limits.nesting_limit)
}

struct Resolver<'a> {
    segments: &'a [Vec<u64>],
}

impl<'a> Resolver<'a> {
    fn read_word(&self, seg: usize, idx: usize) -> Result<u64> {
        self.segments
            .get(seg)
            .and_then(|s| s.get(idx))
            .copied()
            .ok_or_else(|| Error::out_of_bounds(format!("word {idx} in segment {seg}")))
    }

    fn read_words(&self, seg: usize, start: usize, count: usize) -> Result<Vec<u64>> {
        let s = self
            .segments
            .get(seg)
            .ok_or_else(|| Error::out_of_bounds(format!("segment {seg}")))?;
        s.get(start..start + count)
            .map(|w| w.to_vec())
            .ok_or_else(|| Error::out_of_bounds(format!("words [{start}, {})", start + count)))
    }

    fn decode_pointer_at(&mut self, seg: usize, idx: usize, depth: u32) -> Result<AnyValue> {
        let word = self.read_word(seg, idx)?;
        if word == 0 {
            return Ok(AnyValue::Null);
        }
        match pointer::tag_of(word) {
            pointer::TAG_STRUCT | pointer::TAG_LIST => {
                let (offset, _, _) = pointer::struct_pointer_fields(word);
                let content_start = (idx as i64 + 1 + offset)
                    .try_into()
                    .map_err(|_| Error::out_of_bounds("negative content offset"))?;
                self.decode_content(seg, content_start, word, depth)
            }
            pointer::TAG_FAR => {
                let (double, offset, target_seg) = pointer::far_pointer_fields(word);
                let target_seg = target_seg as usize;
                let offset = offset as usize;
                if depth == 0 {
                    return Err(Error::recursion_limit_exceeded("far pointer chain"));
                }
                if !double {
                    self.decode_pointer_at(target_seg, offset, depth - 1)
                } else {
                    let word_a = self.read_word(target_seg, offset)?;
                    let word_b = self.read_word(target_seg, offset + 1)?;
                    if pointer::tag_of(word_a) != pointer::TAG_FAR {
                        return Err(Error::invalid_pointer("double-far landing pad malformed"));
                    }
                    let (double2, offset2, seg2) = pointer::far_pointer_fields(word_a);
                    if double2 {
                        return Err(Error::invalid_pointer("nested double-far pointer"));
                    }
                    self.decode_content(seg2 as usize, offset2 as usize, word_b, depth - 1)
                }
            }
            pointer::TAG_CAPABILITY => {
                let idx = pointer::capability_pointer_index(word);
                if (word >> 2) & 0x3FFF_FFFF != 0 {
                    return Err(Error::invalid_pointer("nonzero reserved bits in capability pointer"));
                }
                Ok(AnyValue::Capability(idx))
            }
            _ => unreachable!("tag_of masks to 2 bits"),
        }
    }

    fn decode_content(&mut self, seg: usize, start: usize, tag_word: u64, depth: u32) -> Result<AnyValue> {
        if depth == 0 {
            return Err(Error::recursion_limit_exceeded("pointer nesting"));
        }
        match pointer::tag_of(tag_word) {
            pointer::TAG_STRUCT => {
                let (_, data_words, pointer_words) = pointer::struct_pointer_fields(tag_word);
                let data = self.read_words(seg, start, data_words as usize)?;
                let mut pointers = Vec::with_capacity(pointer_words as usize);
                for i in 0..pointer_words as usize {
                    pointers.push(self.decode_pointer_at(seg, start + data_words as usize + i, depth - 1)?);
                }
                Ok(AnyValue::Struct(StructValue { data, pointers }))
            }
            pointer::TAG_LIST => {
                let (_, element_size, count_field) = pointer::list_pointer_fields(tag_word);
                self.decode_list(seg, start, element_size, count_field, depth)
            }
            _ => Err(Error::invalid_pointer("tag word for content must be struct or list")),
        }
    }

    fn decode_list(
        &mut self,
        seg: usize,
        start: usize,
        element_size: u8,
        count_field: u32,
        depth: u32,
    ) -> Result<AnyValue> {
        Ok(AnyValue::List(match element_size {
            0 => ListValue::Void(count_field),
            1 => {
                let count = count_field as usize;
                let word_count = count.div_ceil(64);
                let words = self.read_words(seg, start, word_count)?;
                let mut bits = Vec::with_capacity(count);
                for i in 0..count {
                    bits.push((words[i / 64] >> (i % 64)) & 1 != 0);
                }
                ListValue::Bit(bits)
            }
            2 => {
                let count = count_field as usize;
                let word_count = count.div_ceil(8);
                let words = self.read_words(seg, start, word_count)?;
                let mut bytes = Vec::with_capacity(count);
                for w in &words {
                    bytes.extend_from_slice(&w.to_le_bytes());
                }
                bytes.truncate(count);
                ListValue::Byte(bytes)
            }
            3 => {
                let count = count_field as usize;
                let word_count = count.div_ceil(4);
                let words = self.read_words(seg, start, word_count)?;
                let mut vals = Vec::with_capacity(count);
                for w in &words {
                    for chunk in w.to_le_bytes().chunks_exact(2) {
                        vals.push(u16::from_le_bytes(chunk.try_into().unwrap()));
                    }
                }
                vals.truncate(count);
                ListValue::TwoBytes(vals)
            }
            4 => {
                let count = count_field as usize;
                let word_count = count.div_ceil(2);
                let words = self.read_words(seg, start, word_count)?;
                let mut vals = Vec::with_capacity(count);
                for w in &words {
                    for chunk in w.to_le_bytes().chunks_exact(4) {
                        vals.push(u32::from_le_bytes(chunk.try_into().unwrap()));
                    }
                }
                vals.truncate(count);
                ListValue::FourBytes(vals)
            }
            5 => {
                let count = count_field as usize;
                ListValue::EightBytes(self.read_words(seg, start, count)?)
            }
            6 => {
                let count = count_field as usize;
                if depth == 0 {
                    return Err(Error::recursion_limit_exceeded("pointer list"));
                }
                let mut out = Vec::with_capacity(count);
                for i in 0..count {
                    out.push(self.decode_pointer_at(seg, start + i, depth - 1)?);
                }
                ListValue::Pointer(out)
            }
            7 => {
                let total_words = count_field as usize;
                let tag_word = self.read_word(seg, start)?;
                if pointer::tag_of(tag_word) != pointer::TAG_STRUCT {
                    return Err(Error::invalid_pointer("inline composite tag must look like a struct pointer"));
                }
                let (element_count, data_words, pointer_words) = pointer::composite_tag_fields(tag_word);
                let element_words = data_words as usize + pointer_words as usize;
                if element_count as usize * element_words != total_words {
                    return Err(Error::corrupt_value_encoding(
                        "inline composite size does not match element count",
                    ));
                }
                if depth == 0 {
                    return Err(Error::recursion_limit_exceeded("inline composite list"));
                }
                let mut elements = Vec::with_capacity(element_count as usize);
                let body_start = start + 1;
                for i in 0..element_count as usize {
                    let s = body_start + i * element_words;
                    let data = self.read_words(seg, s, data_words as usize)?;
                    let mut pointers = Vec::with_capacity(pointer_words as usize);
                    for k in 0..pointer_words as usize {
                        pointers.push(self.decode_pointer_at(seg, s + data_words as usize + k, depth - 1)?);
                    }
                    elements.push(StructValue { data, pointers });
                }
                ListValue::InlineComposite {
                    struct_data_words: data_words,
                    struct_pointer_words: pointer_words,
                    elements,
                }
            }
            other => return Err(Error::corrupt_value_encoding(format!("unknown element size {other}"))),
        }))
    }
}

/// Encodes a pointer tree as a single-segment on-wire frame.
pub fn encode_message(root: &AnyValue) -> Result<Vec<u8>> {
    let mut words: Vec<u64> = vec![0];
    let mut encoder = Encoder { words: &mut words };
    encoder.encode_pointer_into(0, root)?;
    if words.len() as u64 > DEFAULT_READER_LIMITS.max_total_words {
        return Err(Error::frame_too_large("encoded message exceeds word budget"));
    }
    // table: segment_count - 1 (=0), then one size word. 1 + 1 = 2 words32, even, no pad.
    let mut header = Vec::with_capacity(8);
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&(words.len() as u32).to_le_bytes());
    Ok(segments_to_bytes(&header, &[words]))
}

struct Encoder<'a> {
    words: &'a mut Vec<u64>,
}

impl<'a> Encoder<'a> {
    fn encode_pointer_into(&mut self, slot: usize, value: &AnyValue) -> Result<()> {
        match value {
            AnyValue::Null => {
                self.words[slot] = 0;
                Ok(())
            }
            AnyValue::Capability(idx) => {
                self.words[slot] = pointer::capability_pointer_word(*idx);
                Ok(())
            }
            AnyValue::Struct(s) => {
                if s.data.len() > u16::MAX as usize || s.pointers.len() > u16::MAX as usize {
                    return Err(Error::element_count_too_large("struct section too large"));
                }
                let content_start = self.words.len();
                self.words.extend_from_slice(&s.data);
                let ptr_start = self.words.len();
                self.words.resize(ptr_start + s.pointers.len(), 0);
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::struct_pointer_word(offset, s.data.len() as u16, s.pointers.len() as u16);
                for (i, child) in s.pointers.iter().enumerate() {
                    self.encode_pointer_into(ptr_start + i, child)?;
                }
                Ok(())
            }
            AnyValue::List(l) => self.encode_list_into(slot, l),
        }
    }

    fn encode_list_into(&mut self, slot: usize, l: &ListValue) -> Result<()> {
        let count = l.len();
        if count > 0x1FFF_FFFF {
            return Err(Error::element_count_too_large("list too long"));
        }
        match l {
            ListValue::Void(n) => {
                let content_start = self.words.len();
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 0, *n);
                Ok(())
            }
            ListValue::Bit(bits) => {
                let content_start = self.words.len();
                let word_count = bits.len().div_ceil(64);
                let mut words = vec![0u64; word_count];
                for (i, b) in bits.iter().enumerate() {
                    if *b {
                        words[i / 64] |= 1 << (i % 64);
                    }
                }
                self.words.extend_from_slice(&words);
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 1, count as u32);
                Ok(())
            }
            ListValue::Byte(bytes) => {
                let content_start = self.words.len();
                let word_count = bytes.len().div_ceil(8);
                let mut padded = bytes.clone();
                padded.resize(word_count * 8, 0);
                for chunk in padded.chunks_exact(8) {
                    self.words.push(u64::from_le_bytes(chunk.try_into().unwrap()));
                }
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 2, count as u32);
                Ok(())
            }
            ListValue::TwoBytes(vals) => {
                let content_start = self.words.len();
                let word_count = vals.len().div_ceil(4);
                let mut bytes = Vec::with_capacity(word_count * 8);
                for v in vals {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                bytes.resize(word_count * 8, 0);
                for chunk in bytes.chunks_exact(8) {
                    self.words.push(u64::from_le_bytes(chunk.try_into().unwrap()));
                }
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 3, count as u32);
                Ok(())
            }
            ListValue::FourBytes(vals) => {
                let content_start = self.words.len();
                let word_count = vals.len().div_ceil(2);
                let mut bytes = Vec::with_capacity(word_count * 8);
                for v in vals {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                bytes.resize(word_count * 8, 0);
                for chunk in bytes.chunks_exact(8) {
                    self.words.push(u64::from_le_bytes(chunk.try_into().unwrap()));
                }
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 4, count as u32);
                Ok(())
            }
            ListValue::EightBytes(vals) => {
                let content_start = self.words.len();
                self.words.extend_from_slice(vals);
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 5, count as u32);
                Ok(())
            }
            ListValue::Pointer(items) => {
                let content_start = self.words.len();
                self.words.resize(content_start + items.len(), 0);
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 6, count as u32);
                for (i, item) in items.iter().enumerate() {
                    self.encode_pointer_into(content_start + i, item)?;
                }
                Ok(())
            }
            ListValue::InlineComposite {
                struct_data_words,
                struct_pointer_words,
                elements,
            } => {
                let element_words = *struct_data_words as usize + *struct_pointer_words as usize;
                let content_start = self.words.len();
                self.words.push(0); // tag word, patched below
                for e in elements {
                    let mut data = e.data.clone();
                    data.resize(*struct_data_words as usize, 0);
                    self.words.extend_from_slice(&data);
                    let ptr_start = self.words.len();
                    self.words.resize(ptr_start + *struct_pointer_words as usize, 0);
                    for i in 0..*struct_pointer_words as usize {
                        let child = e.pointers.get(i).unwrap_or(&AnyValue::Null);
                        self.encode_pointer_into(ptr_start + i, child)?;
                    }
                }
                self.words[content_start] =
                    pointer::composite_tag_word(elements.len() as u32, *struct_data_words, *struct_pointer_words);
                let total_words = elements.len() * element_words;
                let offset = content_start as i64 - (slot as i64 + 1);
                self.words[slot] = pointer::list_pointer_word(offset, 7, total_words as u32);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{AnyValue, ListValue, StructValue};

    fn round_trip(v: &AnyValue) -> AnyValue {
        let bytes = encode_message(v).unwrap();
        decode_message(&bytes).unwrap()
    }

    #[test]
    fn round_trips_null() {
        assert_eq!(round_trip(&AnyValue::Null), AnyValue::Null);
    }

    #[test]
    fn round_trips_struct_with_data_and_pointers() {
        let v = AnyValue::Struct(StructValue {
            data: vec![1, 2, 3],
            pointers: vec![AnyValue::text("hello"), AnyValue::Capability(9)],
        });
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn round_trips_primitive_lists() {
        for v in [
            AnyValue::List(ListValue::Void(3)),
            AnyValue::List(ListValue::Bit(vec![true, false, true, true, false])),
            AnyValue::List(ListValue::Byte(vec![1, 2, 3, 4, 5])),
            AnyValue::List(ListValue::TwoBytes(vec![10, 20, 30])),
            AnyValue::List(ListValue::FourBytes(vec![100, 200])),
            AnyValue::List(ListValue::EightBytes(vec![9999999999])),
        ] {
            assert_eq!(round_trip(&v), v);
        }
    }

    #[test]
    fn round_trips_inline_composite_list() {
        let v = AnyValue::List(ListValue::InlineComposite {
            struct_data_words: 1,
            struct_pointer_words: 1,
            elements: vec![
                StructValue {
                    data: vec![1],
                    pointers: vec![AnyValue::Capability(1)],
                },
                StructValue {
                    data: vec![2],
                    pointers: vec![AnyValue::Null],
                },
            ],
        });
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn rejects_oversized_segment_count() {
        let mut buf = vec![0u8; 4];
        buf[0..4].copy_from_slice(&600u32.to_le_bytes());
        let err = parse_segment_table(&buf, &DEFAULT_READER_LIMITS).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FrameTooLarge);
    }
}
