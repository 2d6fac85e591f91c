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

//! The two seams an embedder plugs into a [`crate::peer::Peer`]: a frame
//! sink ([`Transport`]) and a call dispatcher ([`Handler`]).
//!
//! Neither trait is async. Per the peer's single-threaded cooperative model,
//! `Handler::on_call` is handed a live `Peer` handle and is expected to
//! call `Peer::send_return_results`/`send_return_exception` whenever it is
//! ready — synchronously inline, or later from any callback the embedder
//! schedules on the same thread — rather than returning a future the peer
//! itself drives.

use peer_wire::value::AnyValue;

use crate::captable::{ExportId, ImportId};
use crate::error::Result;
use crate::peer::{AnswerId, Peer};

/// The byte-level sink a peer writes framed messages to. The transport is
/// responsible for actually moving bytes (TCP, an in-memory channel, ...);
/// the peer only ever calls `send`.
pub trait Transport {
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Whether the transport is in the process of shutting down. A peer
    /// that observes this should avoid starting new outbound work.
    fn is_closing(&self) -> bool {
        false
    }
}

/// Parameters of an inbound `Call` whose target resolves to a capability
/// this peer hosts, with capability pointers already re-mapped to
/// connection-level import ids by [`crate::inbound::decode_payload`].
pub struct CallParams {
    pub content: AnyValue,
    pub cap_ids: Vec<ImportId>,
}

/// The embedder-supplied logic that answers bootstrap requests and
/// dispatches calls against locally-hosted capabilities.
pub trait Handler {
    /// Returns the export id of the capability this peer exposes as its
    /// bootstrap interface.
    fn bootstrap(&self, peer: &Peer) -> ExportId;

    /// Invoked once per inbound `Call` targeting a local export. The
    /// implementation must eventually call `peer.send_return_results` or
    /// `peer.send_return_exception` for `answer_id`.
    fn on_call(
        &self,
        peer: &Peer,
        answer_id: AnswerId,
        export_id: ExportId,
        interface_id: u64,
        method_id: u16,
        params: CallParams,
    );
}
