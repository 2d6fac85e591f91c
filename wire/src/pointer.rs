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

//! Bit layout of the four Cap'n Proto pointer kinds.
//!
//! Struct pointer (tag 0b00): offset:30 | data_words:16 | pointer_words:16
//! List pointer   (tag 0b01): offset:30 | element_size:3 | element_count:29
//! Far pointer    (tag 0b10): double:1 | offset:29 | <pad> | segment_id:32
//! Capability     (tag 0b11): <pad>:30 | cap_index:32
//!
//! These helpers only encode/decode the bit patterns; resolving an offset
//! into an actual word position is [`crate::message`]'s job.

pub const TAG_STRUCT: u64 = 0;
pub const TAG_LIST: u64 = 1;
pub const TAG_FAR: u64 = 2;
pub const TAG_CAPABILITY: u64 = 3;

pub fn tag_of(word: u64) -> u64 {
    word & 0x3
}

/// Sign-extends a 30-bit two's-complement field into an `i64`.
pub fn sign_extend_30(bits: u64) -> i64 {
    let bits = bits & 0x3FFF_FFFF;
    if bits & 0x2000_0000 != 0 {
        (bits as i64) - (1 << 30)
    } else {
        bits as i64
    }
}

pub fn struct_pointer_word(offset: i64, data_words: u16, pointer_words: u16) -> u64 {
    TAG_STRUCT
        | (((offset as u64) & 0x3FFF_FFFF) << 2)
        | ((data_words as u64) << 32)
        | ((pointer_words as u64) << 48)
}

pub fn struct_pointer_fields(word: u64) -> (i64, u16, u16) {
    let offset = sign_extend_30((word >> 2) & 0x3FFF_FFFF);
    let data_words = ((word >> 32) & 0xFFFF) as u16;
    let pointer_words = ((word >> 48) & 0xFFFF) as u16;
    (offset, data_words, pointer_words)
}

pub fn list_pointer_word(offset: i64, element_size: u8, element_count: u32) -> u64 {
    TAG_LIST
        | (((offset as u64) & 0x3FFF_FFFF) << 2)
        | (((element_size as u64) & 0x7) << 32)
        | (((element_count as u64) & 0x1FFF_FFFF) << 35)
}

pub fn list_pointer_fields(word: u64) -> (i64, u8, u32) {
    let offset = sign_extend_30((word >> 2) & 0x3FFF_FFFF);
    let element_size = ((word >> 32) & 0x7) as u8;
    let element_count = ((word >> 35) & 0x1FFF_FFFF) as u32;
    (offset, element_size, element_count)
}

/// A composite-list tag word reuses the struct pointer layout, except that
/// its "offset" field holds an unsigned element count instead of a signed
/// word offset.
pub fn composite_tag_word(element_count: u32, data_words: u16, pointer_words: u16) -> u64 {
    TAG_STRUCT
        | (((element_count as u64) & 0x3FFF_FFFF) << 2)
        | ((data_words as u64) << 32)
        | ((pointer_words as u64) << 48)
}

pub fn composite_tag_fields(word: u64) -> (u32, u16, u16) {
    let element_count = ((word >> 2) & 0x3FFF_FFFF) as u32;
    let data_words = ((word >> 32) & 0xFFFF) as u16;
    let pointer_words = ((word >> 48) & 0xFFFF) as u16;
    (element_count, data_words, pointer_words)
}

pub fn far_pointer_word(double_far: bool, offset: u32, segment_id: u32) -> u64 {
    TAG_FAR
        | ((double_far as u64) << 2)
        | (((offset as u64) & 0x1FFF_FFFF) << 3)
        | ((segment_id as u64) << 32)
}

pub fn far_pointer_fields(word: u64) -> (bool, u32, u32) {
    let double_far = (word >> 2) & 0x1 != 0;
    let offset = ((word >> 3) & 0x1FFF_FFFF) as u32;
    let segment_id = (word >> 32) as u32;
    (double_far, offset, segment_id)
}

pub fn capability_pointer_word(index: u32) -> u64 {
    TAG_CAPABILITY | ((index as u64) << 32)
}

pub fn capability_pointer_index(word: u64) -> u32 {
    (word >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_pointer_round_trips() {
        let w = struct_pointer_word(-5, 3, 2);
        assert_eq!(tag_of(w), TAG_STRUCT);
        assert_eq!(struct_pointer_fields(w), (-5, 3, 2));
    }

    #[test]
    fn list_pointer_round_trips() {
        let w = list_pointer_word(12345, 7, 90);
        assert_eq!(tag_of(w), TAG_LIST);
        assert_eq!(list_pointer_fields(w), (12345, 7, 90));
    }

    #[test]
    fn far_pointer_round_trips() {
        let w = far_pointer_word(true, 70000, 9);
        assert_eq!(tag_of(w), TAG_FAR);
        assert_eq!(far_pointer_fields(w), (true, 70000, 9));
    }

    #[test]
    fn capability_pointer_round_trips() {
        let w = capability_pointer_word(0xDEAD_BEEF);
        assert_eq!(tag_of(w), TAG_CAPABILITY);
        assert_eq!(capability_pointer_index(w), 0xDEAD_BEEF);
    }
}
