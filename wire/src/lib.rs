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

//! Frame, message, and RPC-protocol codec underlying the `peer` crate.
//!
//! This crate owns everything that is purely about bytes on the wire: the
//! stream de-framer ([`framer`]), the struct/list/pointer codec
//! ([`message`], [`value`]), and the typed Cap'n Proto RPC message set
//! ([`rpc`]). It knows nothing about questions, answers, exports, or
//! promises — that state lives one layer up, in `peer`.

pub mod error;
pub mod framer;
pub mod message;
pub mod pointer;
pub mod rpc;
pub mod value;

pub use error::{Error, ErrorKind, Result};
pub use framer::Framer;
pub use message::{decode_message, decode_message_with_limits, encode_message, ReaderLimits, DEFAULT_READER_LIMITS};
pub use value::{AnyValue, ListValue, StructValue, DEFAULT_DEPTH_LIMIT};
