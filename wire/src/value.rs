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

//! `AnyValue`: an owned, schema-agnostic Cap'n Proto pointer tree.
//!
//! Real `capnp` represents a message as a zero-copy arena over raw bytes and
//! hands out typed `Reader`/`Builder` views into it. We only ever need to
//! traverse a payload to find capability pointers and re-home them (see
//! `peer::outbound` / `peer::inbound`), never to give generated-schema typed
//! access to it, so an owned tree is enough and is considerably simpler to
//! reason about exception-safely.

use crate::error::{Error, Result};

/// How deeply a pointer tree may be nested before traversal gives up.
/// Matches the nesting limit recommended throughout the peer specification.
pub const DEFAULT_DEPTH_LIMIT: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum AnyValue {
    Null,
    Struct(StructValue),
    List(ListValue),
    /// A capability pointer. The `u32` is a cap-table index whose meaning is
    /// contextual: inside a payload under construction it is a connection-level
    /// id (export/import/receiver-answer id); inside a decoded payload it is an
    /// index into that payload's wire-level `cap_table`.
    Capability(u32),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructValue {
    pub data: Vec<u64>,
    pub pointers: Vec<AnyValue>,
}

impl StructValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get_data(&self, idx: usize) -> u64 {
        self.data.get(idx).copied().unwrap_or(0)
    }

    pub fn get_pointer(&self, idx: usize) -> &AnyValue {
        self.pointers.get(idx).unwrap_or(&AnyValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListValue {
    Void(u32),
    Bit(Vec<bool>),
    Byte(Vec<u8>),
    TwoBytes(Vec<u16>),
    FourBytes(Vec<u32>),
    EightBytes(Vec<u64>),
    Pointer(Vec<AnyValue>),
    InlineComposite {
        struct_data_words: u16,
        struct_pointer_words: u16,
        elements: Vec<StructValue>,
    },
}

impl ListValue {
    pub fn len(&self) -> usize {
        match self {
            Self::Void(n) => *n as usize,
            Self::Bit(v) => v.len(),
            Self::Byte(v) => v.len(),
            Self::TwoBytes(v) => v.len(),
            Self::FourBytes(v) => v.len(),
            Self::EightBytes(v) => v.len(),
            Self::Pointer(v) => v.len(),
            Self::InlineComposite { elements, .. } => elements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AnyValue {
    pub fn text(s: &str) -> Self {
        AnyValue::List(ListValue::Byte(s.as_bytes().to_vec()))
    }

    pub fn as_text(&self) -> Result<&str> {
        match self {
            AnyValue::Null => Ok(""),
            AnyValue::List(ListValue::Byte(bytes)) => {
                std::str::from_utf8(bytes).map_err(|_| Error::corrupt_value_encoding("text is not valid utf-8"))
            }
            _ => Err(Error::corrupt_value_encoding("expected text")),
        }
    }

    pub fn as_struct(&self) -> Result<&StructValue> {
        match self {
            AnyValue::Struct(s) => Ok(s),
            AnyValue::Null => {
                // Defaulted struct readers see all-zero fields; represent that
                // directly rather than forcing every accessor to special-case Null.
                Ok(EMPTY_STRUCT)
            }
            _ => Err(Error::corrupt_value_encoding("expected struct")),
        }
    }

    pub fn as_capability(&self) -> Result<u32> {
        match self {
            AnyValue::Capability(idx) => Ok(*idx),
            _ => Err(Error::corrupt_value_encoding("expected capability pointer")),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AnyValue::Null)
    }

    /// Deep-clones the tree, bounded by the standard nesting limit.
    pub fn deep_clone(&self) -> Result<AnyValue> {
        self.deep_clone_bounded(DEFAULT_DEPTH_LIMIT)
    }

    pub fn deep_clone_bounded(&self, depth: u32) -> Result<AnyValue> {
        if depth == 0 {
            return Err(Error::recursion_limit_exceeded("deep_clone"));
        }
        Ok(match self {
            AnyValue::Null => AnyValue::Null,
            AnyValue::Capability(idx) => AnyValue::Capability(*idx),
            AnyValue::Struct(s) => {
                let mut pointers = Vec::with_capacity(s.pointers.len());
                for p in &s.pointers {
                    pointers.push(p.deep_clone_bounded(depth - 1)?);
                }
                AnyValue::Struct(StructValue {
                    data: s.data.clone(),
                    pointers,
                })
            }
            AnyValue::List(l) => AnyValue::List(match l {
                ListValue::Void(n) => ListValue::Void(*n),
                ListValue::Bit(v) => ListValue::Bit(v.clone()),
                ListValue::Byte(v) => ListValue::Byte(v.clone()),
                ListValue::TwoBytes(v) => ListValue::TwoBytes(v.clone()),
                ListValue::FourBytes(v) => ListValue::FourBytes(v.clone()),
                ListValue::EightBytes(v) => ListValue::EightBytes(v.clone()),
                ListValue::Pointer(v) => {
                    let mut out = Vec::with_capacity(v.len());
                    for p in v {
                        out.push(p.deep_clone_bounded(depth - 1)?);
                    }
                    ListValue::Pointer(out)
                }
                ListValue::InlineComposite {
                    struct_data_words,
                    struct_pointer_words,
                    elements,
                } => {
                    let mut out = Vec::with_capacity(elements.len());
                    for e in elements {
                        let mut pointers = Vec::with_capacity(e.pointers.len());
                        for p in &e.pointers {
                            pointers.push(p.deep_clone_bounded(depth - 1)?);
                        }
                        out.push(StructValue {
                            data: e.data.clone(),
                            pointers,
                        });
                    }
                    ListValue::InlineComposite {
                        struct_data_words: *struct_data_words,
                        struct_pointer_words: *struct_pointer_words,
                        elements: out,
                    }
                }
            }),
        })
    }

    /// Walks every capability pointer reachable from this value, in document
    /// order, invoking `f` with mutable access to its index so that callers
    /// can rewrite it in place (used by the outbound encoder and the inbound
    /// re-mapper). Bounded to the standard nesting limit.
    pub fn walk_capabilities_mut(
        &mut self,
        f: &mut impl FnMut(&mut u32) -> Result<()>,
    ) -> Result<()> {
        self.walk_capabilities_mut_bounded(DEFAULT_DEPTH_LIMIT, f)
    }

    fn walk_capabilities_mut_bounded(
        &mut self,
        depth: u32,
        f: &mut impl FnMut(&mut u32) -> Result<()>,
    ) -> Result<()> {
        if depth == 0 {
            return Err(Error::recursion_limit_exceeded("walk_capabilities"));
        }
        match self {
            AnyValue::Null => Ok(()),
            AnyValue::Capability(idx) => f(idx),
            AnyValue::Struct(s) => {
                for p in &mut s.pointers {
                    p.walk_capabilities_mut_bounded(depth - 1, f)?;
                }
                Ok(())
            }
            AnyValue::List(l) => match l {
                ListValue::Pointer(v) => {
                    for p in v {
                        p.walk_capabilities_mut_bounded(depth - 1, f)?;
                    }
                    Ok(())
                }
                ListValue::InlineComposite { elements, .. } => {
                    for e in elements {
                        for p in &mut e.pointers {
                            p.walk_capabilities_mut_bounded(depth - 1, f)?;
                        }
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
        }
    }
}

static EMPTY_STRUCT_STORAGE: StructValue = StructValue {
    data: Vec::new(),
    pointers: Vec::new(),
};
const EMPTY_STRUCT: &StructValue = &EMPTY_STRUCT_STORAGE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_clone_round_trips_nested_struct() {
        let inner = AnyValue::Struct(StructValue {
            data: vec![42],
            pointers: vec![AnyValue::Capability(7)],
        });
        let outer = AnyValue::Struct(StructValue {
            data: vec![],
            pointers: vec![inner.clone(), AnyValue::text("hi")],
        });
        let cloned = outer.deep_clone().unwrap();
        assert_eq!(cloned, outer);
    }

    #[test]
    fn deep_clone_respects_recursion_limit() {
        let mut v = AnyValue::Struct(StructValue::empty());
        for _ in 0..10 {
            v = AnyValue::Struct(StructValue {
                data: vec![],
                pointers: vec![v],
            });
        }
        assert!(v.deep_clone_bounded(5).is_err());
        assert!(v.deep_clone_bounded(20).is_ok());
    }

    #[test]
    fn walk_capabilities_rewrites_in_place() {
        let mut v = AnyValue::Struct(StructValue {
            data: vec![],
            pointers: vec![
                AnyValue::Capability(3),
                AnyValue::List(ListValue::Pointer(vec![AnyValue::Capability(5), AnyValue::Null])),
            ],
        });
        let mut seen = Vec::new();
        v.walk_capabilities_mut(&mut |idx| {
            seen.push(*idx);
            *idx += 100;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![3, 5]);
        match &v {
            AnyValue::Struct(s) => {
                assert_eq!(s.pointers[0], AnyValue::Capability(103));
            }
            _ => unreachable!(),
        }
    }
}
