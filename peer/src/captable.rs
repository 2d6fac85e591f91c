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

//! Per-connection capability bookkeeping: export/import id allocation and
//! reference counting, and promise-export markers.
//!
//! This table only tracks *identities and counts*. It does not know what an
//! export actually points to — that association lives in `peer::peer`, which
//! pairs an `ExportId` with either a locally-hosted capability (via
//! `Handler`) or a pipelined answer. Keeping the two separate means the
//! refcounting rules (which are exactly the spec's invariant 3 and lifecycle
//! rules) can be unit-tested without any transport or handler in the loop.

use std::collections::BTreeMap;

use crate::error::{PeerError, PeerErrorKind, Result};

pub type ExportId = u32;
pub type ImportId = u32;

#[derive(Debug, Default)]
struct Entry {
    ref_count: u32,
    /// Set while the capability behind this id is a promise (not yet
    /// resolved to a settled capability). Cleared by `resolve_export`.
    is_promise: bool,
}

#[derive(Debug, Default)]
pub struct CapTable {
    max_entries: u32,
    exports: BTreeMap<ExportId, Entry>,
    next_export_id: ExportId,
    imports: BTreeMap<ImportId, Entry>,
}

impl CapTable {
    pub fn new(max_entries: u32) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    fn total_entries(&self) -> usize {
        self.exports.len() + self.imports.len()
    }

    fn check_room(&self) -> Result<()> {
        if self.total_entries() as u32 >= self.max_entries {
            return Err(PeerError::state(PeerErrorKind::CapTableFull));
        }
        Ok(())
    }

    /// Allocates a fresh export id with one outstanding reference.
    pub fn alloc_export(&mut self, is_promise: bool) -> Result<ExportId> {
        self.check_room()?;
        let id = self.next_export_id;
        self.next_export_id += 1;
        self.exports.insert(
            id,
            Entry {
                ref_count: 1,
                is_promise,
            },
        );
        Ok(id)
    }

    /// Adds one reference to an export that is being sent again (e.g. the
    /// same capability appearing twice in one payload, or re-sent across
    /// multiple payloads).
    pub fn export_ref(&mut self, id: ExportId) -> Result<()> {
        self.exports
            .get_mut(&id)
            .ok_or(PeerErrorKind::UnknownExport(id))?
            .ref_count += 1;
        Ok(())
    }

    /// Releases `count` references. Returns `true` if the export is now
    /// fully released (the entry has been removed).
    pub fn release_export(&mut self, id: ExportId, count: u32) -> Result<bool> {
        let entry = self
            .exports
            .get_mut(&id)
            .ok_or(PeerErrorKind::UnknownExport(id))?;
        if count > entry.ref_count {
            return Err(PeerError::state(PeerErrorKind::OverReleased(id)));
        }
        entry.ref_count -= count;
        if entry.ref_count == 0 {
            self.exports.remove(&id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Registers `id` as a locally-hosted export if it is not already
    /// tracked (one fresh reference), otherwise adds one more reference.
    /// Used for capabilities whose id is chosen by the embedder rather than
    /// allocated by `alloc_export` — the bootstrap interface, most notably.
    pub fn register_or_ref_export(&mut self, id: ExportId) -> Result<()> {
        if self.exports.contains_key(&id) {
            return self.export_ref(id);
        }
        self.check_room()?;
        self.exports.insert(
            id,
            Entry {
                ref_count: 1,
                is_promise: false,
            },
        );
        if id >= self.next_export_id {
            self.next_export_id = id + 1;
        }
        Ok(())
    }

    pub fn resolve_export(&mut self, id: ExportId) -> Result<()> {
        self.exports
            .get_mut(&id)
            .ok_or(PeerErrorKind::UnknownExport(id))?
            .is_promise = false;
        Ok(())
    }

    pub fn export_is_promise(&self, id: ExportId) -> Result<bool> {
        Ok(self
            .exports
            .get(&id)
            .ok_or(PeerErrorKind::UnknownExport(id))?
            .is_promise)
    }

    pub fn export_exists(&self, id: ExportId) -> bool {
        self.exports.contains_key(&id)
    }

    /// Registers a fresh import reference, e.g. the first time a
    /// `senderHosted` descriptor names an id we have not seen before.
    pub fn import_ref_new(&mut self, id: ImportId, is_promise: bool) -> Result<()> {
        self.check_room()?;
        self.imports
            .entry(id)
            .and_modify(|e| e.ref_count += 1)
            .or_insert(Entry {
                ref_count: 1,
                is_promise,
            });
        Ok(())
    }

    pub fn release_import(&mut self, id: ImportId, count: u32) -> Result<bool> {
        let entry = self
            .imports
            .get_mut(&id)
            .ok_or(PeerErrorKind::UnknownImport(id))?;
        if count > entry.ref_count {
            return Err(PeerError::state(PeerErrorKind::OverReleased(id)));
        }
        entry.ref_count -= count;
        if entry.ref_count == 0 {
            self.imports.remove(&id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn resolve_import(&mut self, id: ImportId) -> Result<()> {
        self.imports
            .get_mut(&id)
            .ok_or(PeerErrorKind::UnknownImport(id))?
            .is_promise = false;
        Ok(())
    }

    pub fn import_is_promise(&self, id: ImportId) -> Result<bool> {
        Ok(self
            .imports
            .get(&id)
            .ok_or(PeerErrorKind::UnknownImport(id))?
            .is_promise)
    }

    pub fn import_exists(&self, id: ImportId) -> bool {
        self.imports.contains_key(&id)
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_ref_counting_round_trips() {
        let mut t = CapTable::new(10);
        let id = t.alloc_export(false).unwrap();
        t.export_ref(id).unwrap();
        assert!(!t.release_export(id, 1).unwrap());
        assert!(t.release_export(id, 1).unwrap());
        assert!(!t.export_exists(id));
    }

    #[test]
    fn over_release_is_rejected() {
        let mut t = CapTable::new(10);
        let id = t.alloc_export(false).unwrap();
        assert!(t.release_export(id, 5).is_err());
    }

    #[test]
    fn cap_table_full_is_enforced() {
        let mut t = CapTable::new(2);
        t.alloc_export(false).unwrap();
        t.import_ref_new(100, false).unwrap();
        assert!(matches!(
            t.alloc_export(false),
            Err(PeerError::State(PeerErrorKind::CapTableFull))
        ));
    }

    #[test]
    fn promise_export_resolves() {
        let mut t = CapTable::new(10);
        let id = t.alloc_export(true).unwrap();
        assert!(t.export_is_promise(id).unwrap());
        t.resolve_export(id).unwrap();
        assert!(!t.export_is_promise(id).unwrap());
    }

    #[test]
    fn register_or_ref_export_creates_then_increments() {
        let mut t = CapTable::new(10);
        t.register_or_ref_export(7).unwrap();
        assert!(t.export_exists(7));
        t.register_or_ref_export(7).unwrap();
        assert!(!t.release_export(7, 1).unwrap());
        assert!(t.release_export(7, 1).unwrap());
        // next_export_id must have been bumped past the registered id so
        // alloc_export never collides with it.
        let fresh = t.alloc_export(false).unwrap();
        assert_eq!(fresh, 8);
    }

    #[test]
    fn duplicate_import_ref_increments_count() {
        let mut t = CapTable::new(10);
        t.import_ref_new(5, false).unwrap();
        t.import_ref_new(5, false).unwrap();
        assert!(!t.release_import(5, 1).unwrap());
        assert!(t.release_import(5, 1).unwrap());
    }
}
