// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Page-chunked row storage backing hash-table entries.
//!
//! The hash table stores opaque `FlatRowPtr` handles instead of rows; handles
//! stay valid across appends because pages never move. Materialization is lazy:
//! a row is only resolved when a probe's hash actually matches.

use crate::runtime::row_batch::Row;

const ROWS_PER_PAGE: usize = 1024;

/// Opaque handle to one row in a `BufferedTupleStream`: page index in the high
/// 32 bits, row-in-page in the low 32.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlatRowPtr(u64);

impl FlatRowPtr {
    pub(crate) fn from_raw(raw: u64) -> Self {
        FlatRowPtr(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    fn new(page_idx: usize, row_idx: usize) -> Self {
        FlatRowPtr(((page_idx as u64) << 32) | row_idx as u64)
    }

    fn page_idx(self) -> usize {
        (self.0 >> 32) as usize
    }

    fn row_idx(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }
}

#[derive(Debug, Default)]
pub struct BufferedTupleStream {
    pages: Vec<Vec<Row>>,
    num_rows: u64,
}

impl BufferedTupleStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn add_row(&mut self, row: Row) -> FlatRowPtr {
        if self
            .pages
            .last()
            .map(|p| p.len() >= ROWS_PER_PAGE)
            .unwrap_or(true)
        {
            self.pages.push(Vec::with_capacity(ROWS_PER_PAGE));
        }
        let page_idx = self.pages.len() - 1;
        let page = self.pages.last_mut().expect("current page");
        let ptr = FlatRowPtr::new(page_idx, page.len());
        page.push(row);
        self.num_rows += 1;
        ptr
    }

    /// Direct borrow of a stored row. Valid in tuple mode, where rows are
    /// pinned in memory for the lifetime of the table.
    pub fn row_at(&self, ptr: FlatRowPtr) -> &Row {
        &self.pages[ptr.page_idx()][ptr.row_idx()]
    }

    /// Materialize a row into the caller's scratch buffer. This is the stream
    /// mode path where the stored representation may not be borrowable.
    pub fn get_tuple_row(&self, ptr: FlatRowPtr, scratch: &mut Row) {
        let row = self.row_at(ptr);
        scratch.clear();
        scratch.extend(row.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferedTupleStream, ROWS_PER_PAGE};
    use crate::runtime::row_batch::Datum;

    #[test]
    fn handles_survive_page_growth() {
        let mut stream = BufferedTupleStream::new();
        let mut ptrs = Vec::new();
        for i in 0..(ROWS_PER_PAGE as i64 * 2 + 5) {
            ptrs.push(stream.add_row(vec![Datum::Int(i)]));
        }
        for (i, ptr) in ptrs.iter().enumerate() {
            assert_eq!(stream.row_at(*ptr), &vec![Datum::Int(i as i64)]);
        }
    }

    #[test]
    fn materializes_into_scratch() {
        let mut stream = BufferedTupleStream::new();
        let ptr = stream.add_row(vec![Datum::Text("abc".to_string())]);
        let mut scratch = Vec::new();
        stream.get_tuple_row(ptr, &mut scratch);
        assert_eq!(scratch, vec![Datum::Text("abc".to_string())]);
    }
}
