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

//! Three-party handoff bookkeeping: `Provide`/`Accept`/`Join` coordination.
//!
//! A real three-vat handoff needs a second connection to the recipient vat,
//! which is outside this peer's scope (the peer only ever speaks to the
//! other end of *its own* connection). What this module tracks is this
//! peer's half of the rendezvous: which question we've offered to a third
//! party via `Provide` (so an `Accept` arriving on some other connection can
//! be matched up by an embedder that wires connections together), and the
//! partial state of an in-progress `Join` while parts are still arriving.

use std::collections::BTreeMap;

use peer_wire::value::AnyValue;

use crate::error::{PeerError, PeerErrorKind, Result};

pub type QuestionId = u32;
pub type JoinId = u32;
pub type ExportId = u32;

/// Derives a stable string key from an opaque recipient/provision/embargo
/// token so it can be used as a map key. `Provide.recipient`, `Accept
/// .provision` and `Accept.embargo` are meant to be compared for equality
/// only, never interpreted — text is the only shape this peer accepts for
/// them.
pub fn token_key(value: &AnyValue) -> Result<String> {
    Ok(value
        .as_text()
        .map_err(|_| PeerError::state(PeerErrorKind::UnknownProvision(0)))?
        .to_string())
}

#[derive(Debug, Clone)]
pub struct Provision {
    pub provide_question_id: QuestionId,
    pub target_export_id: ExportId,
    pub fulfilled: bool,
}

/// Tracks capabilities offered to a third party via `Provide`, keyed by the
/// recipient token so a later `Accept.provision` can be matched by content
/// rather than by the `Provide`'s own question id (the two are unrelated:
/// `Accept` arrives on whatever connection the third party has to us).
#[derive(Debug, Default)]
pub struct ProvideTable {
    by_token: BTreeMap<String, Provision>,
}

impl ProvideTable {
    /// Registers a new provision. Errs if `recipient` was already offered
    /// and not yet superseded — per spec, duplicate recipients are fatal.
    pub fn offer(&mut self, question_id: QuestionId, target_export_id: ExportId, recipient: &AnyValue) -> Result<()> {
        let token = token_key(recipient)?;
        if self.by_token.contains_key(&token) {
            return Err(PeerError::state(PeerErrorKind::UnknownProvision(question_id)));
        }
        self.by_token.insert(
            token,
            Provision {
                provide_question_id: question_id,
                target_export_id,
                fulfilled: false,
            },
        );
        Ok(())
    }

    /// Looks up the export offered under `provision`'s token, marking it
    /// fulfilled. Returns `None` if no such provision is known.
    pub fn fulfill(&mut self, provision: &AnyValue) -> Option<ExportId> {
        let token = token_key(provision).ok()?;
        let entry = self.by_token.get_mut(&token)?;
        entry.fulfilled = true;
        Some(entry.target_export_id)
    }

    /// Removes the provision whose own `Provide.question_id` is
    /// `question_id` (used when that question is finished), returning
    /// whether one was found.
    pub fn remove_by_question(&mut self, question_id: QuestionId) -> bool {
        let token = self
            .by_token
            .iter()
            .find(|(_, p)| p.provide_question_id == question_id)
            .map(|(k, _)| k.clone());
        match token {
            Some(t) => {
                self.by_token.remove(&t);
                true
            }
            None => false,
        }
    }
}

/// Accumulates the parts of a `Join` as they arrive from each leg of a
/// multiply-connected capability. Each part carries its own `question_id`
/// (the `Join` message is itself a question) and names the local export
/// backing that leg, so once every part has arrived every leg's question
/// can be answered with the same capability.
#[derive(Debug, Default)]
pub struct JoinTable {
    /// join_id -> (part_count, parts received so far, indexed by part_num)
    in_progress: BTreeMap<JoinId, (u16, BTreeMap<u16, (QuestionId, ExportId)>)>,
}

impl JoinTable {
    /// Records one part. Returns `Some(legs)` once every part for this
    /// `join_id` has arrived (in `part_num` order), consuming the entry.
    pub fn add_part(
        &mut self,
        join_id: JoinId,
        part_count: u16,
        part_num: u16,
        question_id: QuestionId,
        target_export_id: ExportId,
    ) -> Result<Option<Vec<(QuestionId, ExportId)>>> {
        let (recorded_count, parts) = self
            .in_progress
            .entry(join_id)
            .or_insert_with(|| (part_count, BTreeMap::new()));
        if *recorded_count != part_count {
            return Err(PeerError::state(PeerErrorKind::UnknownJoinPart(join_id)));
        }
        parts.insert(part_num, (question_id, target_export_id));
        if parts.len() == part_count as usize {
            let (_, parts) = self.in_progress.remove(&join_id).unwrap();
            Ok(Some(parts.into_values().collect()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provide_then_accept_round_trips() {
        let mut t = ProvideTable::default();
        t.offer(1, 10, &AnyValue::text("vat-b")).unwrap();
        let export = t.fulfill(&AnyValue::text("vat-b")).unwrap();
        assert_eq!(export, 10);
    }

    #[test]
    fn fulfilling_unknown_provision_returns_none() {
        let mut t = ProvideTable::default();
        assert!(t.fulfill(&AnyValue::text("nope")).is_none());
    }

    #[test]
    fn duplicate_recipient_token_is_rejected() {
        let mut t = ProvideTable::default();
        t.offer(1, 10, &AnyValue::text("vat-b")).unwrap();
        assert!(t.offer(2, 11, &AnyValue::text("vat-b")).is_err());
    }

    #[test]
    fn remove_by_question_clears_the_matching_provision() {
        let mut t = ProvideTable::default();
        t.offer(1, 10, &AnyValue::text("vat-b")).unwrap();
        assert!(t.remove_by_question(1));
        assert!(t.fulfill(&AnyValue::text("vat-b")).is_none());
        assert!(!t.remove_by_question(1));
    }

    #[test]
    fn join_completes_once_every_part_arrives() {
        let mut t = JoinTable::default();
        assert!(t.add_part(5, 2, 0, 100, 7).unwrap().is_none());
        let legs = t.add_part(5, 2, 1, 101, 7).unwrap().unwrap();
        assert_eq!(legs, vec![(100, 7), (101, 7)]);
    }

    #[test]
    fn join_part_count_mismatch_errors() {
        let mut t = JoinTable::default();
        assert!(t.add_part(5, 2, 0, 100, 7).unwrap().is_none());
        assert!(t.add_part(5, 3, 1, 101, 7).is_err());
    }
}
