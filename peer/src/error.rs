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

//! Error type for the peer state machine.
//!
//! Layers `PeerErrorKind` (cap-table, protocol-state, remote, and resource
//! errors) over [`peer_wire::Error`] (framing/decode errors), the same way
//! an adjacent protocol-engine crate in this lineage layers `thiserror` over
//! its own wire-level error enum.

use thiserror::Error as ThisError;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum PeerErrorKind {
    #[error("capability table is full")]
    CapTableFull,
    #[error("unknown export id {0}")]
    UnknownExport(u32),
    #[error("unknown import id {0}")]
    UnknownImport(u32),
    #[error("unknown question id {0}")]
    UnknownQuestion(u32),
    #[error("unknown answer id {0}")]
    UnknownAnswer(u32),
    #[error("answer {0} already returned")]
    AnswerAlreadyReturned(u32),
    #[error("question {0} already finished")]
    QuestionAlreadyFinished(u32),
    #[error("released more references than were outstanding for id {0}")]
    OverReleased(u32),
    #[error("unknown embargo id {0}")]
    UnknownEmbargo(u32),
    #[error("unknown provision question id {0}")]
    UnknownProvision(u32),
    #[error("join has no matching part at index {0}")]
    UnknownJoinPart(u32),
    #[error("peer already aborted the connection")]
    AlreadyAborted,
    #[error("no question id is free")]
    QuestionIdExhausted,
    #[error("remote peer sent abort: {0}")]
    RemoteAbort(String),
    #[error("thirdPartyAnswer id {0} does not have the required bit pattern")]
    InvalidThirdPartyAnswerId(u32),
    #[error("no call target: promised-answer targets are not valid here")]
    MissingCallTarget,
    #[error("disembargo senderLoopback target is not a known local capability")]
    UnknownDisembargoTarget,
}

/// Error produced by the peer state machine: either a framing/decode failure
/// bubbled up from `peer-wire`, or a protocol-state violation caught here.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum PeerError {
    #[error(transparent)]
    Wire(#[from] peer_wire::Error),
    #[error(transparent)]
    State(#[from] PeerErrorKind),
}

impl PeerError {
    pub fn state(kind: PeerErrorKind) -> Self {
        Self::State(kind)
    }

    /// Turns this error into the `Exception` that should be reported back
    /// over the wire (in an `Abort` or a `Return.exception`).
    pub fn to_exception(&self) -> peer_wire::rpc::Exception {
        use peer_wire::rpc::ExceptionType;
        let kind = match self {
            PeerError::Wire(_) => ExceptionType::Failed,
            PeerError::State(PeerErrorKind::RemoteAbort(_)) => ExceptionType::Disconnected,
            PeerError::State(_) => ExceptionType::Failed,
        };
        peer_wire::rpc::Exception {
            kind,
            reason: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
