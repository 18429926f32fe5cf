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
//! Open-addressed hash table for hash joins and aggregations.
//!
//! Buckets carry a flags byte and a 64-bit row handle; the 32-bit hashes live
//! in a parallel array so the probe loop stays cache-dense. Rows that
//! hash-and-compare equal chain off the bucket through index-linked duplicate
//! nodes allocated from pages. The table is single-threaded; parallelism comes
//! from partitioning build input across tables, not from sharing one.

use std::mem;
use std::sync::Arc;

use crate::common::status::{Result, Status};
use crate::exec::hash_table::ctx::HashTableCtx;
use crate::exec::tuple_stream::{BufferedTupleStream, FlatRowPtr};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::row_batch::Row;

/// Resizes kick in past this share of filled buckets; quadratic probing
/// degrades sharply beyond it.
pub const MAX_FILL_FACTOR: f64 = 0.75;

const BUCKET_NOT_FOUND: i64 = -1;
const NODE_NONE: u32 = u32::MAX;
const DUPLICATE_NODES_PER_PAGE: usize = 1024;

const FLAG_FILLED: u8 = 1 << 0;
const FLAG_MATCHED: u8 = 1 << 1;
const FLAG_HAS_DUPLICATES: u8 = 1 << 2;

/// One slot of the open-addressed array. `data` is an `HtData` row handle
/// while the bucket holds a single row, or the index of the head of the
/// duplicate-node chain once `FLAG_HAS_DUPLICATES` is set.
#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    flags: u8,
    data: u64,
}

impl Bucket {
    fn is_filled(&self) -> bool {
        self.flags & FLAG_FILLED != 0
    }

    fn is_matched(&self) -> bool {
        self.flags & FLAG_MATCHED != 0
    }

    fn has_duplicates(&self) -> bool {
        self.flags & FLAG_HAS_DUPLICATES != 0
    }

    fn set_matched(&mut self) {
        self.flags |= FLAG_MATCHED;
    }

    fn set_has_duplicates(&mut self) {
        self.flags |= FLAG_HAS_DUPLICATES;
    }

    fn prepare_for_insert(&mut self) {
        debug_assert!(!self.is_filled());
        self.flags = FLAG_FILLED;
        self.data = 0;
    }
}

/// Off-bucket linked-list element carrying one of several rows that
/// hash-and-compare equal to the same bucket.
#[derive(Clone, Copy, Debug)]
struct DuplicateNode {
    htdata: u64,
    matched: bool,
    next: u32,
}

/// Position in the table: a bucket index plus, inside a duplicate chain, the
/// current node. Navigation methods take the table explicitly.
#[derive(Clone, Copy, Debug)]
pub struct HashTableIterator {
    bucket_idx: i64,
    node_idx: u32,
}

pub struct HashTable {
    quadratic_probing: bool,
    stores_tuples: bool,
    stores_duplicates: bool,
    buckets: Vec<Bucket>,
    /// One 32-bit hash per bucket, separate from `buckets` for cache density.
    hash_array: Vec<u32>,
    num_buckets: i64,
    num_filled_buckets: i64,
    num_buckets_with_duplicates: i64,
    nodes: Vec<DuplicateNode>,
    node_remaining_current_page: usize,
    num_duplicate_nodes: i64,
    has_matches: bool,
    num_resizes: i64,
    mem_tracker: Arc<MemTracker>,
    accounted_bytes: i64,
}

impl HashTable {
    pub fn new(
        quadratic_probing: bool,
        stores_tuples: bool,
        stores_duplicates: bool,
        initial_num_buckets: i64,
        mem_tracker: Arc<MemTracker>,
    ) -> Result<Self> {
        debug_assert!(initial_num_buckets > 0);
        debug_assert!(
            (initial_num_buckets as u64).is_power_of_two(),
            "bucket count must be a power of two"
        );
        let bytes = Self::bucket_bytes(initial_num_buckets);
        if !mem_tracker.try_consume(bytes) {
            return Err(Status::MemLimitExceeded(format!(
                "failed to allocate {} bytes for hash table buckets",
                bytes
            )));
        }
        Ok(Self {
            quadratic_probing,
            stores_tuples,
            stores_duplicates,
            buckets: vec![Bucket::default(); initial_num_buckets as usize],
            hash_array: vec![0; initial_num_buckets as usize],
            num_buckets: initial_num_buckets,
            num_filled_buckets: 0,
            num_buckets_with_duplicates: 0,
            nodes: Vec::new(),
            node_remaining_current_page: 0,
            num_duplicate_nodes: 0,
            has_matches: false,
            num_resizes: 0,
            mem_tracker,
            accounted_bytes: bytes,
        })
    }

    pub fn num_buckets(&self) -> i64 {
        self.num_buckets
    }

    pub fn num_filled_buckets(&self) -> i64 {
        self.num_filled_buckets
    }

    pub fn num_buckets_with_duplicates(&self) -> i64 {
        self.num_buckets_with_duplicates
    }

    pub fn num_duplicate_nodes(&self) -> i64 {
        self.num_duplicate_nodes
    }

    pub fn num_resizes(&self) -> i64 {
        self.num_resizes
    }

    pub fn stores_tuples(&self) -> bool {
        self.stores_tuples
    }

    /// True once any entry was marked matched; right and full-outer joins must
    /// not spill such a table.
    pub fn has_matches(&self) -> bool {
        self.has_matches
    }

    pub fn num_inserts_before_resize(&self) -> i64 {
        std::cmp::max(
            0,
            (self.num_buckets as f64 * MAX_FILL_FACTOR) as i64 - self.num_filled_buckets,
        )
    }

    pub fn current_mem_size(&self) -> i64 {
        self.num_buckets * (mem::size_of::<Bucket>() + mem::size_of::<u32>()) as i64
            + self.num_duplicate_nodes * mem::size_of::<DuplicateNode>() as i64
    }

    /// Insert the row whose expression values sit at the cache cursor of
    /// `ctx`. The caller must have grown the table while
    /// `num_inserts_before_resize` was 0; inserting into a full table is a
    /// programmer error.
    pub fn insert(
        &mut self,
        ctx: &mut HashTableCtx,
        stream: &BufferedTupleStream,
        flat_row: FlatRowPtr,
    ) -> Result<()> {
        let hash = ctx.expr_values_cache().cur_expr_values_hash();
        let mut found = false;
        let bucket_idx = self.probe::<true, true>(ctx, stream, hash, &mut found);
        debug_assert_ne!(bucket_idx, BUCKET_NOT_FOUND, "insert into full hash table");
        if found {
            let node_idx = self.insert_duplicate_node(bucket_idx as usize)?;
            self.nodes[node_idx as usize].htdata = flat_row.raw();
        } else {
            self.prepare_bucket_for_insert(bucket_idx as usize, hash);
            self.buckets[bucket_idx as usize].data = flat_row.raw();
        }
        Ok(())
    }

    /// Probe with the cached current hash, comparing rows with `=` semantics.
    /// Returns an iterator at the first matching entry, or `end()`.
    pub fn find_probe_row(
        &self,
        ctx: &mut HashTableCtx,
        stream: &BufferedTupleStream,
    ) -> HashTableIterator {
        let hash = ctx.expr_values_cache().cur_expr_values_hash();
        let mut found = false;
        let bucket_idx = self.probe::<false, true>(ctx, stream, hash, &mut found);
        if found {
            HashTableIterator {
                bucket_idx,
                node_idx: self.bucket_first_node(bucket_idx),
            }
        } else {
            Self::end()
        }
    }

    /// Probe with inclusive equality, returning the bucket whether it holds a
    /// match (`found = true`) or is the free target an insert would use.
    pub fn find_build_row_bucket(
        &self,
        ctx: &mut HashTableCtx,
        stream: &BufferedTupleStream,
        found: &mut bool,
    ) -> HashTableIterator {
        let hash = ctx.expr_values_cache().cur_expr_values_hash();
        let bucket_idx = self.probe::<true, true>(ctx, stream, hash, found);
        let node_idx = if *found && bucket_idx != BUCKET_NOT_FOUND {
            self.bucket_first_node(bucket_idx)
        } else {
            NODE_NONE
        };
        HashTableIterator {
            bucket_idx,
            node_idx,
        }
    }

    pub fn begin(&self) -> HashTableIterator {
        let mut bucket_idx = BUCKET_NOT_FOUND;
        let mut node_idx = NODE_NONE;
        self.next_filled_bucket(&mut bucket_idx, &mut node_idx);
        HashTableIterator {
            bucket_idx,
            node_idx,
        }
    }

    /// First entry whose matched flag is still unset, for outer-join output of
    /// unmatched build rows.
    pub fn first_unmatched(&self) -> HashTableIterator {
        let mut it = self.begin();
        if it.at_end() {
            return it;
        }
        let bucket = &self.buckets[it.bucket_idx as usize];
        let has_duplicates = self.stores_duplicates && bucket.has_duplicates();
        let head_matched = if has_duplicates {
            self.nodes[it.node_idx as usize].matched
        } else {
            bucket.is_matched()
        };
        if head_matched {
            it.next_unmatched(self);
        }
        it
    }

    pub fn end() -> HashTableIterator {
        HashTableIterator {
            bucket_idx: BUCKET_NOT_FOUND,
            node_idx: NODE_NONE,
        }
    }

    /// Issue an advisory prefetch of the bucket and hash-array cache lines the
    /// given hash will touch, overlapping the fetch with expression evaluation
    /// of the next cached row. `READ` distinguishes probe from build access.
    pub fn prefetch_bucket<const READ: bool>(&self, hash: u32) {
        let bucket_idx = (hash as i64) & (self.num_buckets - 1);
        self.prefetch_bucket_idx::<READ>(bucket_idx);
    }

    #[cfg(target_arch = "x86_64")]
    fn prefetch_bucket_idx<const READ: bool>(&self, bucket_idx: i64) {
        use std::arch::x86_64::{_MM_HINT_T2, _mm_prefetch};
        // SAFETY: bucket_idx is masked into range; prefetch has no side
        // effects beyond the cache.
        unsafe {
            _mm_prefetch(
                self.buckets.as_ptr().add(bucket_idx as usize) as *const i8,
                _MM_HINT_T2,
            );
            _mm_prefetch(
                self.hash_array.as_ptr().add(bucket_idx as usize) as *const i8,
                _MM_HINT_T2,
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn prefetch_bucket_idx<const READ: bool>(&self, _bucket_idx: i64) {}

    /// Rehash every filled bucket into a table of `num_buckets` slots using
    /// the stored hashes; expressions are not re-evaluated. Duplicate chains
    /// move with their bucket.
    pub fn resize_buckets(
        &mut self,
        num_buckets: i64,
        ctx: &mut HashTableCtx,
        stream: &BufferedTupleStream,
    ) -> Result<()> {
        debug_assert!((num_buckets as u64).is_power_of_two());
        debug_assert!(
            num_buckets as f64 * MAX_FILL_FACTOR >= self.num_filled_buckets as f64,
            "target size cannot hold the current entries"
        );
        let new_bytes = Self::bucket_bytes(num_buckets);
        if !self.mem_tracker.try_consume(new_bytes) {
            return Err(Status::MemLimitExceeded(format!(
                "failed to allocate {} bytes to grow hash table to {} buckets",
                new_bytes, num_buckets
            )));
        }
        let mut new_buckets = vec![Bucket::default(); num_buckets as usize];
        let mut new_hash_array = vec![0u32; num_buckets as usize];
        for idx in 0..self.num_buckets as usize {
            let bucket = self.buckets[idx];
            if !bucket.is_filled() {
                continue;
            }
            let hash = self.hash_array[idx];
            let mut found = false;
            let new_idx = self.probe_impl::<true, false>(
                &new_buckets,
                &new_hash_array,
                num_buckets,
                ctx,
                stream,
                hash,
                &mut found,
            );
            debug_assert!(!found);
            debug_assert_ne!(new_idx, BUCKET_NOT_FOUND);
            new_buckets[new_idx as usize] = bucket;
            new_hash_array[new_idx as usize] = hash;
        }
        let old_bytes = Self::bucket_bytes(self.num_buckets);
        self.buckets = new_buckets;
        self.hash_array = new_hash_array;
        self.num_buckets = num_buckets;
        self.num_resizes += 1;
        self.mem_tracker.release(old_bytes);
        self.accounted_bytes += new_bytes - old_bytes;
        Ok(())
    }

    fn bucket_bytes(num_buckets: i64) -> i64 {
        num_buckets * (mem::size_of::<Bucket>() + mem::size_of::<u32>()) as i64
    }

    fn probe<const INCLUSIVE_EQUALITY: bool, const COMPARE_ROW: bool>(
        &self,
        ctx: &mut HashTableCtx,
        stream: &BufferedTupleStream,
        hash: u32,
        found: &mut bool,
    ) -> i64 {
        self.probe_impl::<INCLUSIVE_EQUALITY, COMPARE_ROW>(
            &self.buckets,
            &self.hash_array,
            self.num_buckets,
            ctx,
            stream,
            hash,
            found,
        )
    }

    /// Walk the probe sequence for `hash` over the given bucket arrays.
    /// Returns the index of the first empty bucket (`found = false`), the
    /// first bucket whose row compares equal (`found = true`), or
    /// `BUCKET_NOT_FOUND` after `num_buckets` steps, which is legal only when
    /// the table is full.
    #[allow(clippy::too_many_arguments)]
    fn probe_impl<const INCLUSIVE_EQUALITY: bool, const COMPARE_ROW: bool>(
        &self,
        buckets: &[Bucket],
        hash_array: &[u32],
        num_buckets: i64,
        ctx: &mut HashTableCtx,
        stream: &BufferedTupleStream,
        hash: u32,
        found: &mut bool,
    ) -> i64 {
        debug_assert!(num_buckets > 0);
        *found = false;
        ctx.num_probes += 1;
        let mut bucket_idx = (hash as i64) & (num_buckets - 1);

        // `step` counts the travel distance; for quadratic probing it is also
        // the length of the next jump, which yields the triangular sequence
        // base + k*(k+1)/2 and visits every slot once when N is a power of 2.
        let mut step: i64 = 0;
        let mut scratch = mem::take(&mut ctx.scratch_row);
        let result = loop {
            let bucket = &buckets[bucket_idx as usize];
            if !bucket.is_filled() {
                break bucket_idx;
            }
            if hash == hash_array[bucket_idx as usize] {
                if COMPARE_ROW {
                    let row_equal = {
                        let row = self.bucket_row(bucket, stream, &mut scratch);
                        ctx.equals::<INCLUSIVE_EQUALITY>(row)
                    };
                    if row_equal {
                        *found = true;
                        break bucket_idx;
                    }
                }
                // Row equality failed, or not performed. This is a hash
                // collision; continue searching.
                ctx.num_hash_collisions += 1;
            }
            step += 1;
            if step >= num_buckets {
                ctx.travel_length += step;
                debug_assert!(
                    buckets.iter().all(Bucket::is_filled),
                    "probe of a non-full table failed"
                );
                break BUCKET_NOT_FOUND;
            }
            if self.quadratic_probing {
                bucket_idx = (bucket_idx + step) & (num_buckets - 1);
            } else {
                bucket_idx = (bucket_idx + 1) & (num_buckets - 1);
            }
        };
        ctx.scratch_row = scratch;
        result
    }

    /// Representative row of a bucket: the head duplicate when chained, the
    /// inline handle otherwise.
    fn bucket_row<'a>(
        &self,
        bucket: &Bucket,
        stream: &'a BufferedTupleStream,
        scratch: &'a mut Row,
    ) -> &'a Row {
        let htdata = if self.stores_duplicates && bucket.has_duplicates() {
            self.nodes[bucket.data as usize].htdata
        } else {
            bucket.data
        };
        self.resolve_row(htdata, stream, scratch)
    }

    fn resolve_row<'a>(
        &self,
        htdata: u64,
        stream: &'a BufferedTupleStream,
        scratch: &'a mut Row,
    ) -> &'a Row {
        let ptr = FlatRowPtr::from_raw(htdata);
        if self.stores_tuples {
            stream.row_at(ptr)
        } else {
            stream.get_tuple_row(ptr, scratch);
            scratch
        }
    }

    fn bucket_first_node(&self, bucket_idx: i64) -> u32 {
        let bucket = &self.buckets[bucket_idx as usize];
        if self.stores_duplicates && bucket.has_duplicates() {
            bucket.data as u32
        } else {
            NODE_NONE
        }
    }

    fn prepare_bucket_for_insert(&mut self, bucket_idx: usize, hash: u32) {
        self.buckets[bucket_idx].prepare_for_insert();
        self.hash_array[bucket_idx] = hash;
        self.num_filled_buckets += 1;
    }

    /// Link a fresh duplicate node at the head of the bucket's chain and
    /// return its index; the caller fills in the row handle. Promotes the
    /// bucket to a chain on the first duplicate, which also moves the resident
    /// row into a node of its own.
    fn insert_duplicate_node(&mut self, bucket_idx: usize) -> Result<u32> {
        debug_assert!(self.buckets[bucket_idx].is_filled());
        debug_assert!(self.stores_duplicates);
        let has_duplicates = self.buckets[bucket_idx].has_duplicates();
        // One node for the new row, plus one for the resident row when the
        // bucket is not chained yet.
        let needed = 1 + usize::from(!has_duplicates);
        while self.node_remaining_current_page < needed {
            self.grow_node_array()?;
        }
        if !has_duplicates {
            debug_assert!(!self.buckets[bucket_idx].is_matched());
            let resident_htdata = self.buckets[bucket_idx].data;
            self.append_next_node(bucket_idx, resident_htdata, NODE_NONE);
            self.buckets[bucket_idx].set_has_duplicates();
            self.num_buckets_with_duplicates += 1;
        }
        let head = self.buckets[bucket_idx].data as u32;
        Ok(self.append_next_node(bucket_idx, 0, head))
    }

    fn append_next_node(&mut self, bucket_idx: usize, htdata: u64, next: u32) -> u32 {
        debug_assert!(self.node_remaining_current_page > 0);
        let idx = self.nodes.len() as u32;
        self.nodes.push(DuplicateNode {
            htdata,
            matched: false,
            next,
        });
        self.node_remaining_current_page -= 1;
        self.num_duplicate_nodes += 1;
        self.buckets[bucket_idx].data = idx as u64;
        idx
    }

    fn grow_node_array(&mut self) -> Result<()> {
        let page_bytes = (DUPLICATE_NODES_PER_PAGE * mem::size_of::<DuplicateNode>()) as i64;
        if !self.mem_tracker.try_consume(page_bytes) {
            return Err(Status::MemLimitExceeded(format!(
                "failed to allocate {} bytes for hash table duplicate nodes",
                page_bytes
            )));
        }
        self.nodes.reserve(DUPLICATE_NODES_PER_PAGE);
        self.node_remaining_current_page = DUPLICATE_NODES_PER_PAGE;
        self.accounted_bytes += page_bytes;
        Ok(())
    }

    fn next_filled_bucket(&self, bucket_idx: &mut i64, node_idx: &mut u32) {
        *bucket_idx += 1;
        while *bucket_idx < self.num_buckets {
            if self.buckets[*bucket_idx as usize].is_filled() {
                *node_idx = self.bucket_first_node(*bucket_idx);
                return;
            }
            *bucket_idx += 1;
        }
        *bucket_idx = BUCKET_NOT_FOUND;
        *node_idx = NODE_NONE;
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        self.mem_tracker.release(self.accounted_bytes);
    }
}

impl HashTableIterator {
    pub fn at_end(&self) -> bool {
        self.bucket_idx == BUCKET_NOT_FOUND
    }

    /// Materialize the row at the current position. In tuple mode this is a
    /// direct borrow; otherwise the row is copied into `scratch`.
    pub fn get_row<'a>(
        &self,
        ht: &'a HashTable,
        stream: &'a BufferedTupleStream,
        scratch: &'a mut Row,
    ) -> &'a Row {
        debug_assert!(!self.at_end());
        let bucket = &ht.buckets[self.bucket_idx as usize];
        let htdata = if ht.stores_duplicates && bucket.has_duplicates() {
            ht.nodes[self.node_idx as usize].htdata
        } else {
            bucket.data
        };
        ht.resolve_row(htdata, stream, scratch)
    }

    /// Advance within the duplicate chain first, then to the next filled
    /// bucket.
    pub fn next(&mut self, ht: &HashTable) {
        debug_assert!(!self.at_end());
        if self.in_chain(ht) && ht.nodes[self.node_idx as usize].next != NODE_NONE {
            self.node_idx = ht.nodes[self.node_idx as usize].next;
        } else {
            ht.next_filled_bucket(&mut self.bucket_idx, &mut self.node_idx);
        }
    }

    /// Advance to the next row of the same key, ending the iteration when the
    /// chain is exhausted.
    pub fn next_duplicate(&mut self, ht: &HashTable) {
        debug_assert!(!self.at_end());
        if self.in_chain(ht) && ht.nodes[self.node_idx as usize].next != NODE_NONE {
            self.node_idx = ht.nodes[self.node_idx as usize].next;
        } else {
            self.bucket_idx = BUCKET_NOT_FOUND;
            self.node_idx = NODE_NONE;
        }
    }

    /// Advance to the next entry whose matched flag is unset.
    pub fn next_unmatched(&mut self, ht: &HashTable) {
        debug_assert!(!self.at_end());
        // Remaining unmatched duplicates in the current bucket first.
        if self.in_chain(ht) {
            let mut next = ht.nodes[self.node_idx as usize].next;
            while next != NODE_NONE {
                self.node_idx = next;
                if !ht.nodes[self.node_idx as usize].matched {
                    return;
                }
                next = ht.nodes[self.node_idx as usize].next;
            }
        }
        ht.next_filled_bucket(&mut self.bucket_idx, &mut self.node_idx);
        while self.bucket_idx != BUCKET_NOT_FOUND {
            if !self.in_chain(ht) {
                if !ht.buckets[self.bucket_idx as usize].is_matched() {
                    return;
                }
            } else {
                let mut next = ht.nodes[self.node_idx as usize].next;
                while ht.nodes[self.node_idx as usize].matched && next != NODE_NONE {
                    self.node_idx = next;
                    next = ht.nodes[self.node_idx as usize].next;
                }
                if !ht.nodes[self.node_idx as usize].matched {
                    return;
                }
            }
            ht.next_filled_bucket(&mut self.bucket_idx, &mut self.node_idx);
        }
    }

    /// Mark the current entry matched: per-node inside a chain, per-bucket
    /// otherwise. Also latches the table-wide `has_matches` flag, which
    /// disables spilling of this table.
    pub fn set_matched(&self, ht: &mut HashTable) {
        debug_assert!(!self.at_end());
        if self.in_chain(ht) {
            ht.nodes[self.node_idx as usize].matched = true;
        } else {
            ht.buckets[self.bucket_idx as usize].set_matched();
        }
        ht.has_matches = true;
    }

    pub fn is_matched(&self, ht: &HashTable) -> bool {
        debug_assert!(!self.at_end());
        if self.in_chain(ht) {
            ht.nodes[self.node_idx as usize].matched
        } else {
            ht.buckets[self.bucket_idx as usize].is_matched()
        }
    }

    pub fn prefetch_bucket<const READ: bool>(&self, ht: &HashTable) {
        if !self.at_end() {
            ht.prefetch_bucket_idx::<READ>(self.bucket_idx);
        }
    }

    fn in_chain(&self, ht: &HashTable) -> bool {
        ht.stores_duplicates && ht.buckets[self.bucket_idx as usize].has_duplicates()
    }
}
