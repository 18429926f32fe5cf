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
//! Integration tests for the open-addressed hash table.

use oryxdb::common::status::Status;
use oryxdb::exec::expr::{ScalarExpr, ScalarExprEvaluator};
use oryxdb::exec::hash_table::{HashTable, HashTableCtx, MAX_FILL_FACTOR};
use oryxdb::exec::tuple_stream::BufferedTupleStream;
use oryxdb::runtime::mem_tracker::MemTracker;
use oryxdb::runtime::row_batch::{Datum, Row};

fn key_ctx() -> HashTableCtx {
    let evals = ScalarExprEvaluator::create_evals(&[ScalarExpr::slot(0)]);
    HashTableCtx::new(evals.clone(), evals, false, false, 64)
}

fn table(quadratic: bool, num_buckets: i64) -> HashTable {
    HashTable::new(
        quadratic,
        /* stores_tuples= */ true,
        /* stores_duplicates= */ true,
        num_buckets,
        MemTracker::new_root("hash table test"),
    )
    .expect("create hash table")
}

/// Evaluate and cache the build-side expressions of `row`, then insert it.
fn build_row(
    ht: &mut HashTable,
    ctx: &mut HashTableCtx,
    stream: &mut BufferedTupleStream,
    row: Row,
) {
    let ptr = stream.add_row(row.clone());
    ctx.expr_values_cache_mut().reset();
    assert!(ctx.eval_and_hash_build(&row));
    ht.insert(ctx, stream, ptr).expect("insert");
}

fn probe_row(ctx: &mut HashTableCtx, row: &Row) {
    ctx.expr_values_cache_mut().reset();
    assert!(ctx.eval_and_hash_probe(row));
}

#[test]
fn insert_then_find_returns_equal_row() {
    for quadratic in [false, true] {
        let mut ht = table(quadratic, 16);
        let mut ctx = key_ctx();
        let mut stream = BufferedTupleStream::new();

        for key in 0..8i64 {
            build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(key)]);
        }
        for key in 0..8i64 {
            probe_row(&mut ctx, &vec![Datum::Int(key)]);
            let it = ht.find_probe_row(&mut ctx, &stream);
            assert!(!it.at_end(), "key {} not found (quadratic={})", key, quadratic);
            let mut scratch = Row::new();
            assert_eq!(
                it.get_row(&ht, &stream, &mut scratch),
                &vec![Datum::Int(key)]
            );
        }

        probe_row(&mut ctx, &vec![Datum::Int(999)]);
        assert!(ht.find_probe_row(&mut ctx, &stream).at_end());
    }
}

#[test]
fn duplicate_chain_holds_all_equal_rows() {
    let mut ht = table(true, 16);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    for payload in [100i64, 200, 300] {
        build_row(
            &mut ht,
            &mut ctx,
            &mut stream,
            vec![Datum::Int(7), Datum::Int(payload)],
        );
    }
    assert_eq!(ht.num_filled_buckets(), 1);
    assert_eq!(ht.num_buckets_with_duplicates(), 1);
    assert_eq!(ht.num_duplicate_nodes(), 3);

    probe_row(&mut ctx, &vec![Datum::Int(7)]);
    let mut it = ht.find_probe_row(&mut ctx, &stream);
    let mut payloads = Vec::new();
    while !it.at_end() {
        let mut scratch = Row::new();
        let row = it.get_row(&ht, &stream, &mut scratch);
        match row[1] {
            Datum::Int(v) => payloads.push(v),
            ref other => panic!("unexpected payload {:?}", other),
        }
        it.next_duplicate(&ht);
    }
    payloads.sort_unstable();
    assert_eq!(payloads, vec![100, 200, 300]);
}

#[test]
fn grow_preserves_every_entry() {
    let mut ht = table(true, 16);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    // Fill to the fill factor, then grow and re-verify every key.
    let max_inserts = ht.num_inserts_before_resize();
    assert_eq!(max_inserts, (16.0 * MAX_FILL_FACTOR) as i64);
    for key in 0..max_inserts {
        build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(key)]);
    }
    assert_eq!(ht.num_inserts_before_resize(), 0);

    ht.resize_buckets(32, &mut ctx, &stream).expect("resize");
    assert_eq!(ht.num_buckets(), 32);
    assert_eq!(ht.num_filled_buckets(), max_inserts);
    assert_eq!(ht.num_resizes(), 1);
    assert!(ht.num_inserts_before_resize() > 0);

    for key in 0..max_inserts {
        probe_row(&mut ctx, &vec![Datum::Int(key)]);
        let it = ht.find_probe_row(&mut ctx, &stream);
        assert!(!it.at_end(), "key {} lost after resize", key);
        let mut scratch = Row::new();
        assert_eq!(
            it.get_row(&ht, &stream, &mut scratch),
            &vec![Datum::Int(key)]
        );
    }
}

#[test]
fn quadratic_probe_sequence_is_a_permutation() {
    for num_buckets in [1i64, 2, 4, 16, 64, 256] {
        for base in [0i64, 5, num_buckets - 1] {
            let mut seen = vec![false; num_buckets as usize];
            for k in 0..num_buckets {
                let idx = (base + k * (k + 1) / 2) & (num_buckets - 1);
                seen[idx as usize] = true;
            }
            assert!(
                seen.iter().all(|v| *v),
                "sequence from base {} misses slots of {}",
                base,
                num_buckets
            );
        }
    }
}

#[test]
fn iteration_visits_every_row() {
    let mut ht = table(false, 32);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    for key in 0..10i64 {
        build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(key % 5)]);
    }

    let mut count = 0;
    let mut it = ht.begin();
    while !it.at_end() {
        count += 1;
        it.next(&ht);
    }
    assert_eq!(count, 10);
}

#[test]
fn unmatched_scan_skips_matched_entries() {
    let mut ht = table(true, 16);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    for key in 0..4i64 {
        build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(key)]);
    }
    assert!(!ht.has_matches());

    probe_row(&mut ctx, &vec![Datum::Int(2)]);
    let it = ht.find_probe_row(&mut ctx, &stream);
    assert!(!it.at_end());
    it.set_matched(&mut ht);
    assert!(it.is_matched(&ht));
    assert!(ht.has_matches());

    let mut unmatched = Vec::new();
    let mut it = ht.first_unmatched();
    while !it.at_end() {
        let mut scratch = Row::new();
        match it.get_row(&ht, &stream, &mut scratch)[0] {
            Datum::Int(v) => unmatched.push(v),
            ref other => panic!("unexpected datum {:?}", other),
        }
        it.next_unmatched(&ht);
    }
    unmatched.sort_unstable();
    assert_eq!(unmatched, vec![0, 1, 3]);
}

#[test]
fn unmatched_scan_descends_into_chains() {
    let mut ht = table(true, 16);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(1), Datum::Int(10)]);
    build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(1), Datum::Int(20)]);

    // Mark the chain head matched; the other node must still be visited.
    probe_row(&mut ctx, &vec![Datum::Int(1)]);
    let it = ht.find_probe_row(&mut ctx, &stream);
    it.set_matched(&mut ht);

    let mut remaining = Vec::new();
    let mut it = ht.first_unmatched();
    while !it.at_end() {
        let mut scratch = Row::new();
        match it.get_row(&ht, &stream, &mut scratch)[1] {
            Datum::Int(v) => remaining.push(v),
            ref other => panic!("unexpected datum {:?}", other),
        }
        it.next_unmatched(&ht);
    }
    assert_eq!(remaining.len(), 1);
}

#[test]
fn stream_mode_materializes_through_scratch() {
    let mut ht = HashTable::new(
        true,
        /* stores_tuples= */ false,
        true,
        16,
        MemTracker::new_root("stream mode test"),
    )
    .expect("create hash table");
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    build_row(
        &mut ht,
        &mut ctx,
        &mut stream,
        vec![Datum::Text("k1".to_string()), Datum::Int(1)],
    );
    probe_row(&mut ctx, &vec![Datum::Text("k1".to_string())]);
    let it = ht.find_probe_row(&mut ctx, &stream);
    assert!(!it.at_end());
    let mut scratch = Row::new();
    let row = it.get_row(&ht, &stream, &mut scratch);
    assert_eq!(row[1], Datum::Int(1));
}

#[test]
fn duplicate_node_allocation_failure_is_reported() {
    // Enough budget for the bucket arrays but not for a duplicate-node page.
    let tracker = MemTracker::new_root_with_limit("tiny", 1024);
    let mut ht = HashTable::new(true, true, true, 16, tracker).expect("create hash table");
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(1)]);

    let row = vec![Datum::Int(1)];
    let ptr = stream.add_row(row.clone());
    ctx.expr_values_cache_mut().reset();
    assert!(ctx.eval_and_hash_build(&row));
    let err = ht.insert(&mut ctx, &stream, ptr).expect_err("should fail");
    assert!(matches!(err, Status::MemLimitExceeded(_)));
}

#[test]
fn probe_counters_advance() {
    let mut ht = table(false, 16);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(1)]);
    let probes_after_build = ctx.num_probes();
    assert!(probes_after_build >= 1);

    probe_row(&mut ctx, &vec![Datum::Int(1)]);
    ht.find_probe_row(&mut ctx, &stream);
    assert_eq!(ctx.num_probes(), probes_after_build + 1);
}

#[test]
fn prefetch_is_advisory() {
    let ht = table(true, 16);
    // Must be callable with any hash without touching table state.
    ht.prefetch_bucket::<true>(0xdead_beef);
    ht.prefetch_bucket::<false>(0);
    assert_eq!(ht.num_filled_buckets(), 0);
}

#[test]
fn pipelined_probe_batch_with_prefetch() {
    let mut ht = table(true, 64);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    for key in 0..16i64 {
        build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(key)]);
    }

    // Evaluate the whole probe batch up front, then walk the cache with a
    // one-row prefetch lookahead.
    ctx.expr_values_cache_mut().reset();
    for key in 0..16i64 {
        assert!(ctx.eval_and_hash_probe(&vec![Datum::Int(key)]));
    }
    ctx.expr_values_cache_mut().reset_iteration();

    let mut found_keys = 0;
    while !ctx.expr_values_cache().at_end() {
        if let Some(next_hash) = ctx.expr_values_cache().hash_at_offset(1) {
            ht.prefetch_bucket::<true>(next_hash);
        }
        let it = ht.find_probe_row(&mut ctx, &stream);
        assert!(!it.at_end());
        found_keys += 1;
        ctx.expr_values_cache_mut().next_row();
    }
    assert_eq!(found_keys, 16);
}

#[test]
fn find_build_row_bucket_reports_found() {
    let mut ht = table(true, 16);
    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();

    build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(5)]);

    probe_row(&mut ctx, &vec![Datum::Int(5)]);
    let mut found = false;
    let it = ht.find_build_row_bucket(&mut ctx, &stream, &mut found);
    assert!(found);
    assert!(!it.at_end());

    probe_row(&mut ctx, &vec![Datum::Int(6)]);
    let mut found = true;
    let it = ht.find_build_row_bucket(&mut ctx, &stream, &mut found);
    assert!(!found);
    // The iterator still points at the insert target bucket.
    assert!(!it.at_end());
}

#[test]
fn current_mem_size_counts_buckets_and_nodes() {
    let mut ht = table(true, 16);
    let empty_size = ht.current_mem_size();
    assert!(empty_size > 0);

    let mut ctx = key_ctx();
    let mut stream = BufferedTupleStream::new();
    build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(1)]);
    build_row(&mut ht, &mut ctx, &mut stream, vec![Datum::Int(1)]);
    assert!(ht.current_mem_size() > empty_size);
}
