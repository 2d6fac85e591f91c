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

//! Bookkeeping for promise pipelining: calls queued against an unresolved
//! question, and capabilities held back behind a disembargo handshake.
//!
//! Both tables are pure data structures with no knowledge of the transport
//! or the wire codec — [`crate::peer::Peer`] drives the actual replay/resend
//! logic; keeping the queues here lets their FIFO-per-key ordering guarantee
//! be unit-tested in isolation.

use std::collections::BTreeMap;

use peer_wire::rpc::Call;

pub type QuestionId = u32;
pub type EmbargoId = u32;

/// Calls whose `MessageTarget` is a `PromisedAnswer` pointing at a question
/// that has not yet returned, queued in arrival order per question.
#[derive(Debug, Default)]
pub struct PendingCallQueue {
    queued: BTreeMap<QuestionId, Vec<Call>>,
}

impl PendingCallQueue {
    pub fn enqueue(&mut self, question_id: QuestionId, call: Call) {
        self.queued.entry(question_id).or_default().push(call);
    }

    /// Removes and returns every call queued against `question_id`, in the
    /// order they arrived, so the caller can replay them against the now-
    /// resolved target.
    pub fn drain(&mut self, question_id: QuestionId) -> Vec<Call> {
        self.queued.remove(&question_id).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

pub type ExportId = u32;

/// Calls held back while a loopback disembargo is in flight: until the
/// matching `Disembargo` message round-trips, earlier messages sent to the
/// pre-resolution path might still be in flight, so any call enqueued after
/// the embargo was raised must wait to preserve E-order.
///
/// An embargo is always raised against a specific target export id: while
/// it is pending, any `Call` arriving for that target is held rather than
/// dispatched, so calls cannot overtake the disembargo that is meant to
/// confirm all earlier calls have drained.
#[derive(Debug, Default)]
pub struct EmbargoTable {
    next_id: EmbargoId,
    pending: BTreeMap<EmbargoId, Vec<Call>>,
    target_of: BTreeMap<EmbargoId, ExportId>,
    embargo_of_target: BTreeMap<ExportId, EmbargoId>,
}

impl EmbargoTable {
    pub fn raise_for_target(&mut self, target: ExportId) -> EmbargoId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, Vec::new());
        self.target_of.insert(id, target);
        self.embargo_of_target.insert(target, id);
        id
    }

    /// The embargo currently blocking calls to `target`, if any.
    pub fn embargo_for_target(&self, target: ExportId) -> Option<EmbargoId> {
        self.embargo_of_target.get(&target).copied()
    }

    pub fn enqueue(&mut self, embargo_id: EmbargoId, call: Call) -> bool {
        match self.pending.get_mut(&embargo_id) {
            Some(q) => {
                q.push(call);
                true
            }
            None => false,
        }
    }

    /// Called when the matching `Disembargo` arrives back. Returns the
    /// queued calls in order, clearing the embargo.
    pub fn release(&mut self, embargo_id: EmbargoId) -> Option<Vec<Call>> {
        if let Some(target) = self.target_of.remove(&embargo_id) {
            self.embargo_of_target.remove(&target);
        }
        self.pending.remove(&embargo_id)
    }

    pub fn is_pending(&self, embargo_id: EmbargoId) -> bool {
        self.pending.contains_key(&embargo_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_wire::rpc::{MessageTarget, Payload, SendResultsTo};
    use peer_wire::value::AnyValue;

    fn dummy_call(question_id: u32) -> Call {
        Call {
            question_id,
            target: MessageTarget::ImportedCap(0),
            interface_id: 1,
            method_id: 0,
            params: Payload {
                content: AnyValue::Null,
                cap_table: vec![],
            },
            send_results_to: SendResultsTo::Caller,
            allow_third_party_tail_call: false,
        }
    }

    #[test]
    fn pending_calls_drain_in_arrival_order() {
        let mut q = PendingCallQueue::default();
        q.enqueue(1, dummy_call(10));
        q.enqueue(1, dummy_call(11));
        q.enqueue(2, dummy_call(20));
        let drained = q.drain(1);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].question_id, 10);
        assert_eq!(drained[1].question_id, 11);
        assert!(q.drain(1).is_empty());
        assert_eq!(q.drain(2).len(), 1);
    }

    #[test]
    fn embargo_releases_queued_calls_once() {
        let mut t = EmbargoTable::default();
        let id = t.raise_for_target(0);
        assert!(t.enqueue(id, dummy_call(1)));
        assert!(t.enqueue(id, dummy_call(2)));
        let released = t.release(id).unwrap();
        assert_eq!(released.len(), 2);
        assert!(!t.is_pending(id));
        assert!(t.release(id).is_none());
    }

    #[test]
    fn enqueue_on_unknown_embargo_fails() {
        let mut t = EmbargoTable::default();
        assert!(!t.enqueue(999, dummy_call(1)));
    }

    #[test]
    fn embargo_for_target_tracks_and_clears_on_release() {
        let mut t = EmbargoTable::default();
        let id = t.raise_for_target(5);
        assert_eq!(t.embargo_for_target(5), Some(id));
        t.release(id);
        assert_eq!(t.embargo_for_target(5), None);
    }
}
