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

//! Typed readers/builders for the 13 Cap'n Proto RPC wire message variants.
//!
//! This is the hand-written equivalent of what `capnpc` would generate from
//! `rpc.capnp`: the schema is fixed and small, so there is no machinery here,
//! just `encode`/`decode` pairs built directly on [`crate::value::AnyValue`].
//! Field layout (which data word or pointer slot holds what) is this crate's
//! own convention, not the real Cap'n Proto byte-exact layout — §1 of the
//! governing spec excludes byte-exact wire fidelity beyond capability-pointer
//! traversal, so only internal round-trip consistency matters here.
//!
//! Two boolean fields copy the real protocol's default-value encoding trick
//! (store the value XOR its default, so the zeroed wire state means "default"):
//! `Finish.releaseResultCaps` and `Return.releaseParamCaps` both default to
//! `true`, so a `0` word decodes as `true`.

use crate::error::{Error, Result};
use crate::value::{AnyValue, ListValue, StructValue};

fn data(v: &[u64], idx: usize) -> u64 {
    v.get(idx).copied().unwrap_or(0)
}

fn encode_default_true(v: bool) -> u64 {
    if v {
        0
    } else {
        1
    }
}

fn decode_default_true(w: u64) -> bool {
    w == 0
}

fn struct_of(value: &AnyValue) -> Result<&StructValue> {
    value.as_struct()
}

// ---------------------------------------------------------------------
// Exception
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    Failed,
    Overloaded,
    Disconnected,
    Unimplemented,
}

impl ExceptionType {
    fn to_tag(self) -> u64 {
        match self {
            Self::Failed => 0,
            Self::Overloaded => 1,
            Self::Disconnected => 2,
            Self::Unimplemented => 3,
        }
    }

    fn from_tag(tag: u64) -> Result<Self> {
        Ok(match tag {
            0 => Self::Failed,
            1 => Self::Overloaded,
            2 => Self::Disconnected,
            3 => Self::Unimplemented,
            _ => return Err(Error::invalid_discriminant(format!("exception type {tag}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub kind: ExceptionType,
    pub reason: String,
}

impl Exception {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.kind.to_tag()],
            pointers: vec![AnyValue::text(&self.reason)],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            kind: ExceptionType::from_tag(data(&s.data, 0))?,
            reason: s.get_pointer(0).as_text()?.to_string(),
        })
    }
}

// ---------------------------------------------------------------------
// PromisedAnswer / Op
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Noop,
    GetPointerField(u16),
}

impl Op {
    fn encode(self) -> AnyValue {
        match self {
            Op::Noop => AnyValue::Struct(StructValue {
                data: vec![0],
                pointers: vec![],
            }),
            Op::GetPointerField(idx) => AnyValue::Struct(StructValue {
                data: vec![1, idx as u64],
                pointers: vec![],
            }),
        }
    }

    fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(match data(&s.data, 0) {
            0 => Op::Noop,
            1 => Op::GetPointerField(data(&s.data, 1) as u16),
            other => return Err(Error::invalid_discriminant(format!("transform op {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromisedAnswer {
    pub question_id: u32,
    pub transform: Vec<Op>,
}

impl PromisedAnswer {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.question_id as u64],
            pointers: vec![AnyValue::List(ListValue::Pointer(
                self.transform.iter().map(|op| op.encode()).collect(),
            ))],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        let question_id = data(&s.data, 0) as u32;
        let transform = match s.get_pointer(0) {
            AnyValue::List(ListValue::Pointer(items)) => {
                items.iter().map(Op::decode).collect::<Result<Vec<_>>>()?
            }
            AnyValue::Null => vec![],
            _ => return Err(Error::corrupt_value_encoding("promisedAnswer.transform must be a pointer list")),
        };
        Ok(Self { question_id, transform })
    }
}

// ---------------------------------------------------------------------
// MessageTarget
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MessageTarget {
    ImportedCap(u32),
    PromisedAnswer(PromisedAnswer),
}

impl MessageTarget {
    pub fn encode(&self) -> AnyValue {
        match self {
            MessageTarget::ImportedCap(id) => AnyValue::Struct(StructValue {
                data: vec![0, *id as u64],
                pointers: vec![],
            }),
            MessageTarget::PromisedAnswer(pa) => AnyValue::Struct(StructValue {
                data: vec![1],
                pointers: vec![pa.encode()],
            }),
        }
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(match data(&s.data, 0) {
            0 => MessageTarget::ImportedCap(data(&s.data, 1) as u32),
            1 => MessageTarget::PromisedAnswer(PromisedAnswer::decode(s.get_pointer(0))?),
            other => return Err(Error::invalid_discriminant(format!("messageTarget {other}"))),
        })
    }
}

// ---------------------------------------------------------------------
// CapDescriptor
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CapDescriptor {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer(PromisedAnswer),
    ThirdPartyHosted { id: u32, vine_id: u32 },
}

impl CapDescriptor {
    pub fn encode(&self) -> AnyValue {
        match self {
            CapDescriptor::None => AnyValue::Struct(StructValue {
                data: vec![0],
                pointers: vec![],
            }),
            CapDescriptor::SenderHosted(id) => AnyValue::Struct(StructValue {
                data: vec![1, *id as u64],
                pointers: vec![],
            }),
            CapDescriptor::SenderPromise(id) => AnyValue::Struct(StructValue {
                data: vec![2, *id as u64],
                pointers: vec![],
            }),
            CapDescriptor::ReceiverHosted(id) => AnyValue::Struct(StructValue {
                data: vec![3, *id as u64],
                pointers: vec![],
            }),
            CapDescriptor::ReceiverAnswer(pa) => AnyValue::Struct(StructValue {
                data: vec![4],
                pointers: vec![pa.encode()],
            }),
            CapDescriptor::ThirdPartyHosted { id, vine_id } => AnyValue::Struct(StructValue {
                data: vec![5, *id as u64, *vine_id as u64],
                pointers: vec![],
            }),
        }
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(match data(&s.data, 0) {
            0 => CapDescriptor::None,
            1 => CapDescriptor::SenderHosted(data(&s.data, 1) as u32),
            2 => CapDescriptor::SenderPromise(data(&s.data, 1) as u32),
            3 => CapDescriptor::ReceiverHosted(data(&s.data, 1) as u32),
            4 => CapDescriptor::ReceiverAnswer(PromisedAnswer::decode(s.get_pointer(0))?),
            5 => CapDescriptor::ThirdPartyHosted {
                id: data(&s.data, 1) as u32,
                vine_id: data(&s.data, 2) as u32,
            },
            other => return Err(Error::invalid_discriminant(format!("capDescriptor {other}"))),
        })
    }
}

fn encode_cap_table(caps: &[CapDescriptor]) -> AnyValue {
    AnyValue::List(ListValue::Pointer(caps.iter().map(CapDescriptor::encode).collect()))
}

fn decode_cap_table(value: &AnyValue) -> Result<Vec<CapDescriptor>> {
    match value {
        AnyValue::List(ListValue::Pointer(items)) => {
            items.iter().map(CapDescriptor::decode).collect::<Result<Vec<_>>>()
        }
        AnyValue::Null => Ok(vec![]),
        _ => Err(Error::corrupt_value_encoding("cap table must be a pointer list")),
    }
}

// ---------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub content: AnyValue,
    pub cap_table: Vec<CapDescriptor>,
}

impl Payload {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![],
            pointers: vec![self.content.clone(), encode_cap_table(&self.cap_table)],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            content: s.get_pointer(0).clone(),
            cap_table: decode_cap_table(s.get_pointer(1))?,
        })
    }
}

// ---------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SendResultsTo {
    Caller,
    Yourself,
    ThirdParty(AnyValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub question_id: u32,
    pub target: MessageTarget,
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Payload,
    pub send_results_to: SendResultsTo,
    pub allow_third_party_tail_call: bool,
}

impl Call {
    pub fn encode(&self) -> AnyValue {
        let (sr_tag, sr_ptr) = match &self.send_results_to {
            SendResultsTo::Caller => (0u64, AnyValue::Null),
            SendResultsTo::Yourself => (1u64, AnyValue::Null),
            SendResultsTo::ThirdParty(v) => (2u64, v.clone()),
        };
        AnyValue::Struct(StructValue {
            data: vec![
                self.question_id as u64,
                self.interface_id,
                self.method_id as u64,
                self.allow_third_party_tail_call as u64,
                sr_tag,
            ],
            pointers: vec![self.target.encode(), self.params.encode(), sr_ptr],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        let send_results_to = match data(&s.data, 4) {
            0 => SendResultsTo::Caller,
            1 => SendResultsTo::Yourself,
            2 => SendResultsTo::ThirdParty(s.get_pointer(2).clone()),
            other => return Err(Error::invalid_discriminant(format!("sendResultsTo {other}"))),
        };
        Ok(Self {
            question_id: data(&s.data, 0) as u32,
            interface_id: data(&s.data, 1),
            method_id: data(&s.data, 2) as u16,
            allow_third_party_tail_call: data(&s.data, 3) != 0,
            target: MessageTarget::decode(s.get_pointer(0))?,
            params: Payload::decode(s.get_pointer(1))?,
            send_results_to,
        })
    }
}

// ---------------------------------------------------------------------
// Return
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ReturnWhich {
    Results(Payload),
    Exception(Exception),
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion(u32),
    /// The answer will arrive on a different connection once a matching
    /// `ThirdPartyAnswer` names it; carries the completion key the two
    /// sides rendezvous on (§4.8.5).
    AwaitFromThirdParty(AnyValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    pub answer_id: u32,
    pub release_param_caps: bool,
    pub which: ReturnWhich,
}

impl Return {
    pub fn encode(&self) -> AnyValue {
        let (tag, d2, p0, p1) = match &self.which {
            ReturnWhich::Results(payload) => (0u64, 0u64, payload.encode(), AnyValue::Null),
            ReturnWhich::Exception(exc) => (1, 0, AnyValue::Null, exc.encode()),
            ReturnWhich::Canceled => (2, 0, AnyValue::Null, AnyValue::Null),
            ReturnWhich::ResultsSentElsewhere => (3, 0, AnyValue::Null, AnyValue::Null),
            ReturnWhich::TakeFromOtherQuestion(id) => (4, *id as u64, AnyValue::Null, AnyValue::Null),
            ReturnWhich::AwaitFromThirdParty(v) => (5, 0, v.clone(), AnyValue::Null),
        };
        AnyValue::Struct(StructValue {
            data: vec![
                self.answer_id as u64,
                encode_default_true(self.release_param_caps),
                tag,
                d2,
            ],
            pointers: vec![p0, p1],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        let which = match data(&s.data, 2) {
            0 => ReturnWhich::Results(Payload::decode(s.get_pointer(0))?),
            1 => ReturnWhich::Exception(Exception::decode(s.get_pointer(1))?),
            2 => ReturnWhich::Canceled,
            3 => ReturnWhich::ResultsSentElsewhere,
            4 => ReturnWhich::TakeFromOtherQuestion(data(&s.data, 3) as u32),
            5 => ReturnWhich::AwaitFromThirdParty(s.get_pointer(0).clone()),
            other => return Err(Error::invalid_discriminant(format!("return.which {other}"))),
        };
        Ok(Self {
            answer_id: data(&s.data, 0) as u32,
            release_param_caps: decode_default_true(data(&s.data, 1)),
            which,
        })
    }
}

// ---------------------------------------------------------------------
// Finish
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finish {
    pub question_id: u32,
    pub release_result_caps: bool,
    pub require_early_cancellation: bool,
}

impl Finish {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![
                self.question_id as u64,
                encode_default_true(self.release_result_caps),
                self.require_early_cancellation as u64,
            ],
            pointers: vec![],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            question_id: data(&s.data, 0) as u32,
            release_result_caps: decode_default_true(data(&s.data, 1)),
            require_early_cancellation: data(&s.data, 2) != 0,
        })
    }
}

// ---------------------------------------------------------------------
// Resolve
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveWhich {
    Cap(CapDescriptor),
    Exception(Exception),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolve {
    pub promise_id: u32,
    pub which: ResolveWhich,
}

impl Resolve {
    pub fn encode(&self) -> AnyValue {
        let (tag, p0, p1) = match &self.which {
            ResolveWhich::Cap(cap) => (0u64, cap.encode(), AnyValue::Null),
            ResolveWhich::Exception(exc) => (1, AnyValue::Null, exc.encode()),
        };
        AnyValue::Struct(StructValue {
            data: vec![self.promise_id as u64, tag],
            pointers: vec![p0, p1],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        let which = match data(&s.data, 1) {
            0 => ResolveWhich::Cap(CapDescriptor::decode(s.get_pointer(0))?),
            1 => ResolveWhich::Exception(Exception::decode(s.get_pointer(1))?),
            other => return Err(Error::invalid_discriminant(format!("resolve.which {other}"))),
        };
        Ok(Self {
            promise_id: data(&s.data, 0) as u32,
            which,
        })
    }
}

// ---------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub id: u32,
    pub reference_count: u32,
}

impl Release {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.id as u64, self.reference_count as u64],
            pointers: vec![],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            id: data(&s.data, 0) as u32,
            reference_count: data(&s.data, 1) as u32,
        })
    }
}

// ---------------------------------------------------------------------
// Disembargo
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DisembargoContext {
    SenderLoopback(u32),
    ReceiverLoopback(u32),
    /// Releases a parked `Accept`; carries the same embargo token the
    /// `Accept` named, so the accepting vat can find the parked entries.
    Accept(AnyValue),
    Provide(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disembargo {
    pub target: MessageTarget,
    pub context: DisembargoContext,
}

impl Disembargo {
    pub fn encode(&self) -> AnyValue {
        let (tag, embargo_id, p1) = match &self.context {
            DisembargoContext::SenderLoopback(id) => (0u64, *id as u64, AnyValue::Null),
            DisembargoContext::ReceiverLoopback(id) => (1, *id as u64, AnyValue::Null),
            DisembargoContext::Accept(token) => (2, 0, token.clone()),
            DisembargoContext::Provide(id) => (3, *id as u64, AnyValue::Null),
        };
        AnyValue::Struct(StructValue {
            data: vec![tag, embargo_id],
            pointers: vec![self.target.encode(), p1],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        let context = match data(&s.data, 0) {
            0 => DisembargoContext::SenderLoopback(data(&s.data, 1) as u32),
            1 => DisembargoContext::ReceiverLoopback(data(&s.data, 1) as u32),
            2 => DisembargoContext::Accept(s.get_pointer(1).clone()),
            3 => DisembargoContext::Provide(data(&s.data, 1) as u32),
            other => return Err(Error::invalid_discriminant(format!("disembargo.context {other}"))),
        };
        Ok(Self {
            target: MessageTarget::decode(s.get_pointer(0))?,
            context,
        })
    }
}

// ---------------------------------------------------------------------
// Three-party transfer: Provide / Accept / Join / ThirdPartyAnswer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Provide {
    pub question_id: u32,
    pub target: MessageTarget,
    /// Opaque third-party recipient descriptor, passed through unexamined.
    pub recipient: AnyValue,
}

impl Provide {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.question_id as u64],
            pointers: vec![self.target.encode(), self.recipient.clone()],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            question_id: data(&s.data, 0) as u32,
            target: MessageTarget::decode(s.get_pointer(0))?,
            recipient: s.get_pointer(1).clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accept {
    pub question_id: u32,
    /// Embargo token chosen by the sender of this `Accept`. `None` means the
    /// result may be returned as soon as the provision is found; `Some(key)`
    /// means the accepting vat must wait for `Disembargo(accept, key)`
    /// before the `Return` may go out (§4.8.3).
    pub embargo: Option<AnyValue>,
    /// Opaque provision-id descriptor identifying the `Provide` being accepted.
    pub provision: AnyValue,
}

impl Accept {
    pub fn encode(&self) -> AnyValue {
        let (has_embargo, embargo_value) = match &self.embargo {
            Some(v) => (1u64, v.clone()),
            None => (0, AnyValue::Null),
        };
        AnyValue::Struct(StructValue {
            data: vec![self.question_id as u64, has_embargo],
            pointers: vec![self.provision.clone(), embargo_value],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        let embargo = if data(&s.data, 1) != 0 {
            Some(s.get_pointer(1).clone())
        } else {
            None
        };
        Ok(Self {
            question_id: data(&s.data, 0) as u32,
            embargo,
            provision: s.get_pointer(0).clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinKeyPart {
    pub join_id: u32,
    pub part_count: u16,
    pub part_num: u16,
    /// Opaque per-part join-key material, compared by the receiving vat
    /// across every part to decide whether the joined capabilities coincide.
    pub part: AnyValue,
}

impl JoinKeyPart {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.join_id as u64, self.part_count as u64, self.part_num as u64],
            pointers: vec![self.part.clone()],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            join_id: data(&s.data, 0) as u32,
            part_count: data(&s.data, 1) as u16,
            part_num: data(&s.data, 2) as u16,
            part: s.get_pointer(0).clone(),
        })
    }
}

/// A `Join` is itself a question: each leg gets its own `question_id` and
/// `target`, layered with the `join_id`/`part_count`/`part_num` correlation
/// key that lets the receiving vat match up every leg (§4.8.4).
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub question_id: u32,
    pub target: MessageTarget,
    pub key_part: JoinKeyPart,
}

impl Join {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.question_id as u64],
            pointers: vec![self.target.encode(), self.key_part.encode()],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            question_id: data(&s.data, 0) as u32,
            target: MessageTarget::decode(s.get_pointer(0))?,
            key_part: JoinKeyPart::decode(s.get_pointer(1))?,
        })
    }
}

/// Rendezvous message telling a third-party vat how to contact the vat
/// holding an in-flight answer, completing the `awaitFromThirdParty` half
/// of a three-party handoff alongside `Provide`/`Accept`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThirdPartyAnswer {
    pub question_id: u32,
    /// Completion key the two sides rendezvous on; matches the token
    /// carried in the corresponding `Return.awaitFromThirdParty`.
    pub completion: AnyValue,
}

impl ThirdPartyAnswer {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.question_id as u64],
            pointers: vec![self.completion.clone()],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            question_id: data(&s.data, 0) as u32,
            completion: s.get_pointer(0).clone(),
        })
    }
}

// ---------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap {
    pub question_id: u32,
    pub deprecated_object_id: AnyValue,
}

impl Bootstrap {
    pub fn encode(&self) -> AnyValue {
        AnyValue::Struct(StructValue {
            data: vec![self.question_id as u64],
            pointers: vec![self.deprecated_object_id.clone()],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        Ok(Self {
            question_id: data(&s.data, 0) as u32,
            deprecated_object_id: s.get_pointer(0).clone(),
        })
    }
}

// ---------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Unimplemented(Box<Message>),
    Abort(Exception),
    Bootstrap(Bootstrap),
    Call(Call),
    Return(Return),
    Finish(Finish),
    Resolve(Resolve),
    Release(Release),
    Disembargo(Disembargo),
    Provide(Provide),
    Accept(Accept),
    Join(Join),
    ThirdPartyAnswer(ThirdPartyAnswer),
}

impl Message {
    pub fn encode(&self) -> AnyValue {
        let (tag, inner) = match self {
            Message::Unimplemented(inner) => (0u64, inner.encode()),
            Message::Abort(exc) => (1, exc.encode()),
            Message::Bootstrap(b) => (2, b.encode()),
            Message::Call(c) => (3, c.encode()),
            Message::Return(r) => (4, r.encode()),
            Message::Finish(f) => (5, f.encode()),
            Message::Resolve(r) => (6, r.encode()),
            Message::Release(r) => (7, r.encode()),
            Message::Disembargo(d) => (8, d.encode()),
            Message::Provide(p) => (9, p.encode()),
            Message::Accept(a) => (10, a.encode()),
            Message::Join(j) => (11, j.encode()),
            Message::ThirdPartyAnswer(t) => (12, t.encode()),
        };
        AnyValue::Struct(StructValue {
            data: vec![tag],
            pointers: vec![inner],
        })
    }

    pub fn decode(value: &AnyValue) -> Result<Self> {
        let s = struct_of(value)?;
        let inner = s.get_pointer(0);
        Ok(match data(&s.data, 0) {
            0 => Message::Unimplemented(Box::new(Message::decode(inner)?)),
            1 => Message::Abort(Exception::decode(inner)?),
            2 => Message::Bootstrap(Bootstrap::decode(inner)?),
            3 => Message::Call(Call::decode(inner)?),
            4 => Message::Return(Return::decode(inner)?),
            5 => Message::Finish(Finish::decode(inner)?),
            6 => Message::Resolve(Resolve::decode(inner)?),
            7 => Message::Release(Release::decode(inner)?),
            8 => Message::Disembargo(Disembargo::decode(inner)?),
            9 => Message::Provide(Provide::decode(inner)?),
            10 => Message::Accept(Accept::decode(inner)?),
            11 => Message::Join(Join::decode(inner)?),
            12 => Message::ThirdPartyAnswer(ThirdPartyAnswer::decode(inner)?),
            other => return Err(Error::invalid_discriminant(format!("message tag {other}"))),
        })
    }
}

/// Validates the bit pattern the spec reserves for third-party answer ids:
/// bit 30 set, bit 31 clear. Ordinary question ids never set bit 30, so
/// this distinguishes a locally-issued id from one received as part of a
/// third-party handoff.
pub fn is_third_party_answer_id(id: u32) -> bool {
    (id & 0x4000_0000) != 0 && (id & 0x8000_0000) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_message, encode_message};

    fn round_trip(msg: &Message) -> Message {
        let encoded = msg.encode();
        let bytes = encode_message(&encoded).unwrap();
        let decoded = decode_message(&bytes).unwrap();
        Message::decode(&decoded).unwrap()
    }

    #[test]
    fn round_trips_call_with_pipelined_target() {
        let msg = Message::Call(Call {
            question_id: 7,
            target: MessageTarget::PromisedAnswer(PromisedAnswer {
                question_id: 3,
                transform: vec![Op::GetPointerField(1), Op::Noop],
            }),
            interface_id: 0xDEAD_BEEF_0000_0001,
            method_id: 5,
            params: Payload {
                content: AnyValue::text("hi"),
                cap_table: vec![CapDescriptor::SenderHosted(9)],
            },
            send_results_to: SendResultsTo::Yourself,
            allow_third_party_tail_call: true,
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn round_trips_return_variants() {
        for which in [
            ReturnWhich::Results(Payload {
                content: AnyValue::Null,
                cap_table: vec![],
            }),
            ReturnWhich::Exception(Exception {
                kind: ExceptionType::Overloaded,
                reason: "too busy".into(),
            }),
            ReturnWhich::Canceled,
            ReturnWhich::ResultsSentElsewhere,
            ReturnWhich::TakeFromOtherQuestion(42),
            ReturnWhich::AwaitFromThirdParty(AnyValue::text("completion-key")),
        ] {
            let msg = Message::Return(Return {
                answer_id: 1,
                release_param_caps: false,
                which,
            });
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn finish_default_true_bit_decodes_as_true() {
        let finish = Finish {
            question_id: 4,
            release_result_caps: true,
            require_early_cancellation: false,
        };
        let encoded = finish.encode();
        let s = encoded.as_struct().unwrap();
        assert_eq!(s.get_data(1), 0, "default-true field should encode as zero");
        assert_eq!(Finish::decode(&encoded).unwrap(), finish);
    }

    #[test]
    fn round_trips_three_party_messages() {
        let msgs = [
            Message::Provide(Provide {
                question_id: 1,
                target: MessageTarget::ImportedCap(2),
                recipient: AnyValue::text("vat-b"),
            }),
            Message::Accept(Accept {
                question_id: 2,
                embargo: Some(AnyValue::text("embargo-token")),
                provision: AnyValue::text("provision-token"),
            }),
            Message::Join(Join {
                question_id: 5,
                target: MessageTarget::ImportedCap(2),
                key_part: JoinKeyPart {
                    join_id: 3,
                    part_count: 2,
                    part_num: 0,
                    part: AnyValue::text("part-0"),
                },
            }),
            Message::ThirdPartyAnswer(ThirdPartyAnswer {
                question_id: 4,
                completion: AnyValue::text("vat-c"),
            }),
        ];
        for msg in msgs {
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn round_trips_unimplemented_wrapping_disembargo() {
        let inner = Message::Disembargo(Disembargo {
            target: MessageTarget::ImportedCap(1),
            context: DisembargoContext::ReceiverLoopback(77),
        });
        let msg = Message::Unimplemented(Box::new(inner));
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn third_party_answer_id_bit_pattern() {
        assert!(is_third_party_answer_id(0x4000_0001));
        assert!(!is_third_party_answer_id(0x0000_0001));
        assert!(!is_third_party_answer_id(0xC000_0001));
    }
}
