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

//! The peer-level state machine for one Cap'n Proto RPC connection: the
//! layer above `peer_wire` that turns decoded messages into questions,
//! answers, imports, exports, promise pipelining, and three-party transfer.

pub mod captable;
pub mod config;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod peer;
pub mod pipeline;
pub mod threeparty;
pub mod transport;

pub use captable::{CapTable, ExportId, ImportId};
pub use config::PeerConfig;
pub use error::{PeerError, PeerErrorKind, Result};
pub use peer::{AnswerId, Peer, QuestionId};
pub use transport::{CallParams, Handler, Transport};
