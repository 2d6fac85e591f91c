// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
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

//! Error type for the frame, message, and protocol codecs.
//!
//! Mirrors `capnp::Error`: a small `kind` discriminant plus a free-text
//! description, rather than a generic boxed-error type.

use std::fmt;

/// The framing- and decode-level error kinds from the peer specification's
/// error taxonomy (framing/decode + message-codec-adjacent resource errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidFrame,
    FrameTooLarge,
    TruncatedMessage,
    InvalidPointer,
    OutOfBounds,
    InvalidDiscriminant,
    MissingPromisedAnswer,
    MissingCallTarget,
    MissingCapDescriptorId,
    MissingThirdPartyCapDescriptor,
    CorruptValueEncoding,
    RecursionLimitExceeded,
    ElementCountTooLarge,
    OutOfMemory,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidFrame => "invalid frame",
            Self::FrameTooLarge => "frame too large",
            Self::TruncatedMessage => "truncated message",
            Self::InvalidPointer => "invalid pointer",
            Self::OutOfBounds => "pointer target out of bounds",
            Self::InvalidDiscriminant => "invalid discriminant",
            Self::MissingPromisedAnswer => "missing promisedAnswer",
            Self::MissingCallTarget => "missing call target",
            Self::MissingCapDescriptorId => "missing cap descriptor id",
            Self::MissingThirdPartyCapDescriptor => "missing third-party cap descriptor",
            Self::CorruptValueEncoding => "corrupt value encoding",
            Self::RecursionLimitExceeded => "recursion limit exceeded",
            Self::ElementCountTooLarge => "element count too large",
            Self::OutOfMemory => "out of memory",
        };
        f.write_str(s)
    }
}

/// An error produced by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub extra: String,
}

impl Error {
    pub fn new(kind: ErrorKind, extra: impl Into<String>) -> Self {
        Self {
            kind,
            extra: extra.into(),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            extra: String::new(),
        }
    }
}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        impl Error {
            pub fn $name(extra: impl Into<String>) -> Self {
                Self::new(ErrorKind::$kind, extra)
            }
        }
    };
}

ctor!(invalid_frame, InvalidFrame);
ctor!(frame_too_large, FrameTooLarge);
ctor!(truncated_message, TruncatedMessage);
ctor!(invalid_pointer, InvalidPointer);
ctor!(out_of_bounds, OutOfBounds);
ctor!(invalid_discriminant, InvalidDiscriminant);
ctor!(missing_promised_answer, MissingPromisedAnswer);
ctor!(missing_call_target, MissingCallTarget);
ctor!(missing_cap_descriptor_id, MissingCapDescriptorId);
ctor!(
    missing_third_party_cap_descriptor,
    MissingThirdPartyCapDescriptor
);
ctor!(corrupt_value_encoding, CorruptValueEncoding);
ctor!(recursion_limit_exceeded, RecursionLimitExceeded);
ctor!(element_count_too_large, ElementCountTooLarge);
ctor!(out_of_memory, OutOfMemory);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extra.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.extra)
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
