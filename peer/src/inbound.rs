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

//! Inbound payload re-mapper: the mirror image of [`crate::outbound`].
//!
//! Walks a decoded payload whose `AnyValue::Capability` slots hold indices
//! into that payload's wire-level `cap_table`, and rewrites each one to the
//! connection-level id the peer state machine assigned it (a fresh import,
//! an existing one, or a pipelined answer's eventual capability).

use peer_wire::rpc::CapDescriptor;
use peer_wire::value::AnyValue;
use peer_wire::{Error, Result};

use crate::captable::ImportId;

/// Rewrites `content`'s capability pointers in place using `cap_table` to
/// look up each wire index and `resolve` to turn the matching descriptor
/// into a connection-level id.
pub fn decode_payload(
    mut content: AnyValue,
    cap_table: &[CapDescriptor],
    mut resolve: impl FnMut(&CapDescriptor) -> Result<ImportId>,
) -> Result<AnyValue> {
    content.walk_capabilities_mut(&mut |wire_index| {
        let descriptor = cap_table
            .get(*wire_index as usize)
            .ok_or_else(|| Error::missing_cap_descriptor_id(format!("index {wire_index}")))?;
        *wire_index = resolve(descriptor)?;
        Ok(())
    })?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_wire::value::StructValue;

    #[test]
    fn rewrites_wire_indices_to_connection_ids() {
        let content = AnyValue::Struct(StructValue {
            data: vec![],
            pointers: vec![AnyValue::Capability(0), AnyValue::Capability(1)],
        });
        let cap_table = vec![CapDescriptor::SenderHosted(100), CapDescriptor::SenderHosted(200)];
        let out = decode_payload(content, &cap_table, |d| match d {
            CapDescriptor::SenderHosted(id) => Ok(*id + 1),
            _ => unreachable!(),
        })
        .unwrap();
        match out {
            AnyValue::Struct(s) => {
                assert_eq!(s.pointers[0], AnyValue::Capability(101));
                assert_eq!(s.pointers[1], AnyValue::Capability(201));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let content = AnyValue::Capability(5);
        let err = decode_payload(content, &[], |_| unreachable!()).unwrap_err();
        assert_eq!(err.kind, peer_wire::ErrorKind::MissingCapDescriptorId);
    }
}
