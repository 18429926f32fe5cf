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
//! Per-probe-side state for the hash table.
//!
//! Expressions are evaluated a batch at a time into the `ExprValuesCache`
//! before any bucket is touched; hashing and equality run against the cached
//! tuples, never against the input rows, so build rows materialize only on an
//! actual hash match.

use crate::exec::expr::ScalarExprEvaluator;
use crate::exec::hash_table::hash::{HASH_SEEDS, hash_row};
use crate::runtime::row_batch::Row;

/// Batch of pre-evaluated expression tuples with per-row null flag and hash.
pub struct ExprValuesCache {
    capacity: usize,
    cur_row: usize,
    values: Vec<Row>,
    any_null: Vec<bool>,
    hashes: Vec<u32>,
}

impl ExprValuesCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            cur_row: 0,
            values: Vec::with_capacity(capacity),
            any_null: Vec::with_capacity(capacity),
            hashes: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.cur_row = 0;
        self.values.clear();
        self.any_null.clear();
        self.hashes.clear();
    }

    pub fn reset_iteration(&mut self) {
        self.cur_row = 0;
    }

    pub fn next_row(&mut self) {
        self.cur_row += 1;
    }

    pub fn at_end(&self) -> bool {
        self.cur_row >= self.values.len()
    }

    pub fn cur_expr_values(&self) -> &Row {
        &self.values[self.cur_row]
    }

    pub fn cur_has_null(&self) -> bool {
        self.any_null[self.cur_row]
    }

    pub fn cur_expr_values_hash(&self) -> u32 {
        self.hashes[self.cur_row]
    }

    /// Hash of the row `lookahead` positions past the cursor, if any. Used to
    /// prefetch the bucket of an upcoming row while evaluating the current one.
    pub fn hash_at_offset(&self, lookahead: usize) -> Option<u32> {
        self.hashes.get(self.cur_row + lookahead).copied()
    }

    fn push(&mut self, values: Row, any_null: bool, hash: u32) {
        debug_assert!(self.values.len() < self.capacity, "expr values cache full");
        self.values.push(values);
        self.any_null.push(any_null);
        self.hashes.push(hash);
    }
}

pub struct HashTableCtx {
    build_expr_evals: Vec<ScalarExprEvaluator>,
    probe_expr_evals: Vec<ScalarExprEvaluator>,
    stores_nulls: bool,
    finds_some_nulls: bool,
    level: usize,
    expr_values_cache: ExprValuesCache,
    pub(crate) scratch_row: Row,
    // Probe statistics, updated by HashTable::probe.
    pub(crate) num_probes: i64,
    pub(crate) num_hash_collisions: i64,
    pub(crate) travel_length: i64,
}

impl HashTableCtx {
    pub fn new(
        build_expr_evals: Vec<ScalarExprEvaluator>,
        probe_expr_evals: Vec<ScalarExprEvaluator>,
        stores_nulls: bool,
        finds_some_nulls: bool,
        cache_capacity: usize,
    ) -> Self {
        Self {
            build_expr_evals,
            probe_expr_evals,
            stores_nulls,
            finds_some_nulls,
            level: 0,
            expr_values_cache: ExprValuesCache::with_capacity(cache_capacity),
            scratch_row: Row::new(),
            num_probes: 0,
            num_hash_collisions: 0,
            travel_length: 0,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn set_level(&mut self, level: usize) {
        debug_assert!(level < HASH_SEEDS.len());
        self.level = level;
    }

    pub fn stores_nulls(&self) -> bool {
        self.stores_nulls
    }

    pub fn finds_some_nulls(&self) -> bool {
        self.finds_some_nulls
    }

    pub fn seed(&self) -> u64 {
        HASH_SEEDS[self.level]
    }

    pub fn expr_values_cache(&self) -> &ExprValuesCache {
        &self.expr_values_cache
    }

    pub fn expr_values_cache_mut(&mut self) -> &mut ExprValuesCache {
        &mut self.expr_values_cache
    }

    pub fn num_probes(&self) -> i64 {
        self.num_probes
    }

    pub fn num_hash_collisions(&self) -> i64 {
        self.num_hash_collisions
    }

    pub fn travel_length(&self) -> i64 {
        self.travel_length
    }

    /// Evaluate the build expressions over `row` into the cache's current
    /// slot. Returns false (and caches nothing) when the row has a null the
    /// table does not store; such rows are discarded at build time.
    pub fn eval_and_hash_build(&mut self, row: &Row) -> bool {
        let (values, any_null) = eval_row(&self.build_expr_evals, row);
        if !self.stores_nulls && any_null {
            return false;
        }
        let hash = hash_row(&values, self.seed());
        self.expr_values_cache.push(values, any_null, hash);
        true
    }

    /// Probe-side twin of `eval_and_hash_build`. Null keys survive only when
    /// the table both stores and finds nulls (e.g. full outer joins).
    pub fn eval_and_hash_probe(&mut self, row: &Row) -> bool {
        let (values, any_null) = eval_row(&self.probe_expr_evals, row);
        if any_null && !(self.stores_nulls && self.finds_some_nulls) {
            return false;
        }
        let hash = hash_row(&values, self.seed());
        self.expr_values_cache.push(values, any_null, hash);
        true
    }

    /// Compare the cached current expression tuple against `build_row`, which
    /// is re-evaluated through the build expressions.
    pub(crate) fn equals<const INCLUSIVE_EQUALITY: bool>(&self, build_row: &Row) -> bool {
        let cached = self.expr_values_cache.cur_expr_values();
        debug_assert_eq!(cached.len(), self.build_expr_evals.len());
        for (eval, probe_value) in self.build_expr_evals.iter().zip(cached.iter()) {
            let build_value = eval.eval(build_row);
            let equal = if INCLUSIVE_EQUALITY {
                build_value.eq_inclusive(probe_value)
            } else {
                build_value.eq_standard(probe_value)
            };
            if !equal {
                return false;
            }
        }
        true
    }
}

fn eval_row(evals: &[ScalarExprEvaluator], row: &Row) -> (Row, bool) {
    let mut values = Vec::with_capacity(evals.len());
    let mut any_null = false;
    for eval in evals {
        let value = eval.eval(row);
        any_null |= value.is_null();
        values.push(value);
    }
    (values, any_null)
}

#[cfg(test)]
mod tests {
    use super::HashTableCtx;
    use crate::exec::expr::{ScalarExpr, ScalarExprEvaluator};
    use crate::runtime::row_batch::Datum;

    fn ctx(stores_nulls: bool, finds_some_nulls: bool) -> HashTableCtx {
        let evals = ScalarExprEvaluator::create_evals(&[ScalarExpr::slot(0)]);
        HashTableCtx::new(evals.clone(), evals, stores_nulls, finds_some_nulls, 16)
    }

    #[test]
    fn build_discards_nulls_unless_stored() {
        let mut c = ctx(false, false);
        assert!(!c.eval_and_hash_build(&vec![Datum::Null]));
        assert!(c.eval_and_hash_build(&vec![Datum::Int(1)]));

        let mut c = ctx(true, false);
        assert!(c.eval_and_hash_build(&vec![Datum::Null]));
    }

    #[test]
    fn probe_nulls_need_finds_some_nulls() {
        let mut c = ctx(true, false);
        assert!(!c.eval_and_hash_probe(&vec![Datum::Null]));

        let mut c = ctx(true, true);
        assert!(c.eval_and_hash_probe(&vec![Datum::Null]));
    }

    #[test]
    fn equals_modes_differ_on_null() {
        let mut c = ctx(true, true);
        assert!(c.eval_and_hash_probe(&vec![Datum::Null]));
        assert!(c.equals::<true>(&vec![Datum::Null]));
        assert!(!c.equals::<false>(&vec![Datum::Null]));
    }
}
