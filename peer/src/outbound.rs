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

//! Outbound payload encoder: walks a payload built with connection-level
//! capability ids and rewrites it into wire-level cap-table indices.
//!
//! Reuses [`peer_wire::value::AnyValue::walk_capabilities_mut`] — the same
//! generic visitor the inbound re-mapper uses — so the two directions stay
//! in lock-step as the payload representation evolves.
//!
//! Exception-safety: `resolve` may itself fail partway through a walk (e.g.
//! a stale receiver-answer cap id). [`encode_payload`] never mutates peer
//! state directly; it only returns a list of side effects the caller should
//! apply (`to_consume`) after the walk has fully succeeded, so a failed
//! encode never leaves the cap table half-updated.

use std::collections::HashMap;

use peer_wire::rpc::CapDescriptor;
use peer_wire::value::AnyValue;
use peer_wire::{Error, Result};

use crate::captable::ExportId;

/// What the outbound encoder needs to know about one capability reachable
/// from a payload, as resolved by the peer state machine.
pub struct OutboundCap {
    pub descriptor: CapDescriptor,
    /// If this descriptor was built from a receiver-answer entry (a
    /// capability we only know about because the *other* peer told us it
    /// lives in one of our own answers), the answer id to release our
    /// bookkeeping for once the whole payload is safely encoded.
    pub consume_answer: Option<u32>,
}

pub struct EncodedPayload {
    pub content: AnyValue,
    pub cap_table: Vec<CapDescriptor>,
    pub to_consume: Vec<u32>,
}

/// Encodes `content` (whose `AnyValue::Capability` ids are connection-level
/// `ExportId`s) into wire form, deduplicating repeated references to the
/// same capability into a single cap-table entry.
pub fn encode_payload(
    mut content: AnyValue,
    mut resolve: impl FnMut(ExportId) -> Result<OutboundCap>,
) -> Result<EncodedPayload> {
    let mut cap_table = Vec::new();
    let mut to_consume = Vec::new();
    let mut index_of: HashMap<ExportId, u32> = HashMap::new();
    let mut first_err: Option<Error> = None;

    content.walk_capabilities_mut(&mut |id| {
        if let Some(&idx) = index_of.get(id) {
            *id = idx;
            return Ok(());
        }
        match resolve(*id) {
            Ok(cap) => {
                let idx = cap_table.len() as u32;
                if let Some(answer_id) = cap.consume_answer {
                    to_consume.push(answer_id);
                }
                cap_table.push(cap.descriptor);
                index_of.insert(*id, idx);
                *id = idx;
                Ok(())
            }
            Err(e) => {
                // Stop the walk but let the caller see the real error
                // instead of a generic "missing cap" produced by whatever
                // the visitor does with our Err.
                first_err = Some(e.clone());
                Err(e)
            }
        }
    })?;

    if let Some(e) = first_err {
        return Err(e);
    }

    Ok(EncodedPayload {
        content,
        cap_table,
        to_consume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_wire::value::{ListValue, StructValue};

    #[test]
    fn dedups_repeated_capability_references() {
        let content = AnyValue::Struct(StructValue {
            data: vec![],
            pointers: vec![
                AnyValue::Capability(7),
                AnyValue::List(ListValue::Pointer(vec![AnyValue::Capability(7)])),
            ],
        });
        let mut calls = 0;
        let result = encode_payload(content, |id| {
            calls += 1;
            assert_eq!(id, 7);
            Ok(OutboundCap {
                descriptor: CapDescriptor::SenderHosted(id),
                consume_answer: None,
            })
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(result.cap_table.len(), 1);
        assert_eq!(result.cap_table[0], CapDescriptor::SenderHosted(7));
    }

    #[test]
    fn resolve_failure_leaves_nothing_to_consume() {
        let content = AnyValue::Capability(3);
        let err = encode_payload(content, |_| Err(Error::missing_cap_descriptor_id("gone"))).unwrap_err();
        assert_eq!(err.kind, peer_wire::ErrorKind::MissingCapDescriptorId);
    }

    #[test]
    fn records_receiver_answer_entries_to_consume() {
        let content = AnyValue::Capability(9);
        let result = encode_payload(content, |id| {
            Ok(OutboundCap {
                descriptor: CapDescriptor::SenderHosted(id),
                consume_answer: Some(42),
            })
        })
        .unwrap();
        assert_eq!(result.to_consume, vec![42]);
    }
}
