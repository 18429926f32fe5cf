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
//! Per-fragment-instance execution context.
//!
//! Carries the query id, the cancellation flag polled by blocking wait
//! predicates, the sticky first error, and the frequently used query options.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::config;
use crate::common::status::{Result, Status};
use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<Status>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: Status) {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<Status> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

#[derive(Debug)]
pub struct RuntimeState {
    query_id: UniqueId,
    batch_size: usize,
    num_rows_produced_limit: i64,
    cancelled: AtomicBool,
    error_state: Arc<RuntimeErrorState>,
    mem_tracker: Arc<MemTracker>,
}

impl RuntimeState {
    pub fn new(query_id: UniqueId, mem_tracker: Arc<MemTracker>) -> Self {
        Self {
            query_id,
            batch_size: config::batch_size(),
            num_rows_produced_limit: config::num_rows_produced_limit(),
            cancelled: AtomicBool::new(false),
            error_state: Arc::new(RuntimeErrorState::default()),
            mem_tracker,
        }
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 0 means no cap on rows handed to the client.
    pub fn num_rows_produced_limit(&self) -> i64 {
        self.num_rows_produced_limit
    }

    pub fn set_num_rows_produced_limit(&mut self, limit: i64) {
        self.num_rows_produced_limit = limit;
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn set_error(&self, err: Status) {
        self.error_state.set_error(err);
    }

    /// The first error recorded for the query, a cancellation status if the
    /// query was cancelled, or Ok.
    pub fn query_status(&self) -> Result<()> {
        if let Some(err) = self.error_state.error() {
            return Err(err);
        }
        if self.is_cancelled() {
            return Err(Status::cancelled());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mem_tracker;

    fn test_state() -> RuntimeState {
        RuntimeState::new(
            UniqueId { hi: 1, lo: 2 },
            mem_tracker::process_mem_tracker(),
        )
    }

    #[test]
    fn cancel_is_reflected_in_status() {
        let state = test_state();
        assert_eq!(state.batch_size(), 1024);
        assert!(state.query_status().is_ok());
        state.cancel();
        assert!(state.is_cancelled());
        let err = state.query_status().expect_err("expected cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn first_error_wins() {
        let state = test_state();
        state.set_error(Status::internal("first"));
        state.set_error(Status::internal("second"));
        let err = state.query_status().expect_err("expected error");
        assert_eq!(err, Status::internal("first"));
    }
}
