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

//! Peer configuration, analogous to `capnp::message::ReaderOptions`: a plain
//! data struct with a `Default` impl rather than an env/file-based layer.

use peer_wire::message::ReaderLimits;

#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    /// Maximum number of simultaneously live entries across the export and
    /// import tables combined.
    pub max_cap_table_entries: u32,
    pub reader_limits: ReaderLimits,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_cap_table_entries: 10_000,
            reader_limits: ReaderLimits::default(),
        }
    }
}

impl PeerConfig {
    pub fn with_max_cap_table_entries(mut self, max: u32) -> Self {
        self.max_cap_table_entries = max;
        self
    }

    pub fn with_reader_limits(mut self, limits: ReaderLimits) -> Self {
        self.reader_limits = limits;
        self
    }
}
