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
//! Blocking hand-off between the fragment executor and the client fetch loop.
//!
//! One producer thread calls `send`/`flush_final`/`close`; one consumer thread
//! calls `get_next`. The two meet on a single mailbox slot guarded by one mutex
//! and two condition variables: the consumer publishes an empty result set and
//! a row budget, the producer fills it from the current batch and hands it
//! back. Cancellation lives in the runtime state and is re-checked by every
//! wait predicate.

use std::cmp::min;
use std::mem;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::common::logging::debug;
use crate::common::status::{Result, Status};
use crate::exec::expr::ScalarExprEvaluator;
use crate::runtime::row_batch::{Row, RowBatch};
use crate::runtime::runtime_state::RuntimeState;

/// Buffer of materialized output rows owned by the fetch side.
#[derive(Debug, Default)]
pub struct QueryResultSet {
    rows: Vec<Row>,
}

impl QueryResultSet {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn take_rows(&mut self) -> Vec<Row> {
        mem::take(&mut self.rows)
    }

    /// Project `num_rows` rows of `batch` starting at `start` through the
    /// output expressions and append them. An empty evaluator list is an
    /// identity projection.
    fn add_rows(
        &mut self,
        evals: &[ScalarExprEvaluator],
        batch: &RowBatch,
        start: usize,
        num_rows: usize,
    ) {
        for idx in start..start + num_rows {
            let row = batch.row(idx);
            if evals.is_empty() {
                self.rows.push(row.clone());
            } else {
                self.rows.push(evals.iter().map(|e| e.eval(row)).collect());
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SenderState {
    RowsPending,
    Eos,
    ClosedNotEos,
}

/// The mailbox. `Requested` is the consumer's published result set ("results
/// is non-nil"); the producer drains it back to `Filled`, which only the
/// consumer empties.
enum FetchSlot {
    Empty,
    Requested {
        results: QueryResultSet,
        num_rows_requested: usize,
    },
    Filled(QueryResultSet),
}

struct SinkShared {
    slot: FetchSlot,
    sender_state: SenderState,
}

pub struct BlockingResultSink {
    shared: Mutex<SinkShared>,
    sender_cv: Condvar,
    consumer_cv: Condvar,
    output_expr_evals: Vec<ScalarExprEvaluator>,
    num_rows_produced: AtomicI64,
}

impl BlockingResultSink {
    pub fn new(output_expr_evals: Vec<ScalarExprEvaluator>) -> Self {
        Self {
            shared: Mutex::new(SinkShared {
                slot: FetchSlot::Empty,
                sender_state: SenderState::RowsPending,
            }),
            sender_cv: Condvar::new(),
            consumer_cv: Condvar::new(),
            output_expr_evals,
            num_rows_produced: AtomicI64::new(0),
        }
    }

    pub fn sender_state(&self) -> SenderState {
        self.lock().sender_state
    }

    fn lock(&self) -> MutexGuard<'_, SinkShared> {
        self.shared.lock().expect("result sink lock")
    }

    /// Producer side. Blocks until the consumer asks for rows, then copies up
    /// to the requested count from `batch` and hands the result set back.
    /// Repeats until the batch is drained or the query is cancelled.
    pub fn send(&self, state: &RuntimeState, batch: &RowBatch) -> Result<()> {
        self.update_and_check_rows_produced_limit(state, batch)?;

        let mut current_batch_row = 0;
        // Zero-row batches never wake the consumer: clients are not expected
        // to cope with empty result sets before EOS.
        while current_batch_row < batch.num_rows() {
            let mut shared = self.lock();
            while !matches!(shared.slot, FetchSlot::Requested { .. }) && !state.is_cancelled() {
                shared = self.sender_cv.wait(shared).expect("result sink wait");
            }
            if state.is_cancelled() {
                return Err(Status::cancelled());
            }

            let FetchSlot::Requested {
                mut results,
                num_rows_requested,
            } = mem::replace(&mut shared.slot, FetchSlot::Empty)
            else {
                unreachable!("sender woke without an outstanding fetch");
            };
            let mut num_to_fetch = batch.num_rows() - current_batch_row;
            // A requested count of 0 means "no cap for this pass".
            if num_rows_requested > 0 {
                num_to_fetch = min(num_to_fetch, num_rows_requested);
            }
            results.add_rows(&self.output_expr_evals, batch, current_batch_row, num_to_fetch);
            current_batch_row += num_to_fetch;
            shared.slot = FetchSlot::Filled(results);
            self.consumer_cv.notify_all();
        }
        Ok(())
    }

    /// Producer side: all rows have been sent, wake the consumer so it can
    /// observe EOS.
    pub fn flush_final(&self, _state: &RuntimeState) -> Result<()> {
        let mut shared = self.lock();
        shared.sender_state = SenderState::Eos;
        self.consumer_cv.notify_all();
        Ok(())
    }

    /// Producer side. `flush_final` won't have been called when the fragment
    /// instance hits an error before sending all rows.
    pub fn close(&self, _state: &RuntimeState) {
        let mut shared = self.lock();
        if shared.sender_state == SenderState::RowsPending {
            shared.sender_state = SenderState::ClosedNotEos;
        }
        self.consumer_cv.notify_all();
    }

    /// Wakes both sides so they re-check the cancellation flag. The flag
    /// itself lives in the runtime state and must be set by the caller first.
    pub fn cancel(&self, state: &RuntimeState) {
        debug_assert!(state.is_cancelled());
        let _shared = self.lock();
        self.sender_cv.notify_all();
        self.consumer_cv.notify_all();
    }

    /// Consumer side. Publishes `results` and a row budget, wakes the
    /// producer, and blocks until the producer drains the request, the sender
    /// leaves `RowsPending`, or the query is cancelled. `eos` stays false on
    /// the error/close path.
    pub fn get_next(
        &self,
        state: &RuntimeState,
        results: &mut QueryResultSet,
        num_results: usize,
        eos: &mut bool,
    ) -> Result<()> {
        let mut shared = self.lock();
        shared.slot = FetchSlot::Requested {
            results: mem::take(results),
            num_rows_requested: num_results,
        };
        self.sender_cv.notify_all();

        while shared.sender_state == SenderState::RowsPending
            && matches!(shared.slot, FetchSlot::Requested { .. })
            && !state.is_cancelled()
        {
            shared = self.consumer_cv.wait(shared).expect("result sink wait");
        }

        match mem::replace(&mut shared.slot, FetchSlot::Empty) {
            FetchSlot::Filled(filled) | FetchSlot::Requested { results: filled, .. } => {
                *results = filled;
            }
            FetchSlot::Empty => {}
        }
        *eos = shared.sender_state == SenderState::Eos;
        state.query_status()
    }

    fn update_and_check_rows_produced_limit(
        &self,
        state: &RuntimeState,
        batch: &RowBatch,
    ) -> Result<()> {
        let limit = state.num_rows_produced_limit();
        let produced = self
            .num_rows_produced
            .fetch_add(batch.num_rows() as i64, Ordering::AcqRel)
            + batch.num_rows() as i64;
        if limit > 0 && produced > limit {
            debug!(
                "query {} exceeded rows produced limit: {} > {}",
                state.query_id(),
                produced,
                limit
            );
            return Err(Status::RowsProducedLimitExceeded { produced, limit });
        }
        Ok(())
    }
}
