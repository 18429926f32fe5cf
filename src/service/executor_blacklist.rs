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
//! Executors hidden from scheduling after coordinator-observed failures.
//!
//! Entries move BLACKLISTED -> ON_PROBATION once the blacklist timeout
//! elapses and are forgotten after a longer probation interval. There is no
//! background timer; `maintenance` runs on the gossip callback path against a
//! monotonic clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::config;
use crate::common::logging::debug;
use crate::service::statestore::BackendDescriptor;

/// Probation lasts this many blacklist timeouts.
const PROBATION_TIMEOUT_MULTIPLIER: u32 = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlacklistState {
    NotBlacklisted,
    Blacklisted,
    OnProbation,
}

#[derive(Clone, Debug)]
struct Entry {
    be_desc: BackendDescriptor,
    state: BlacklistState,
    /// When the entry entered its current state.
    since: Instant,
}

#[derive(Clone, Debug)]
pub struct ExecutorBlacklist {
    entries: HashMap<String, Entry>,
    timeout: Duration,
}

impl Default for ExecutorBlacklist {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            timeout: Duration::from_millis(config::blacklist_timeout_ms()),
        }
    }
}

impl ExecutorBlacklist {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hide the executor from scheduling. Re-blacklisting an entry already on
    /// probation restarts the blacklist timeout.
    pub fn blacklist(&mut self, be_desc: BackendDescriptor) {
        debug!("Blacklisting {}", be_desc.address);
        let key = be_desc.backend_id.clone();
        self.entries.insert(
            key,
            Entry {
                be_desc,
                state: BlacklistState::Blacklisted,
                since: Instant::now(),
            },
        );
    }

    /// Remove any entry for the backend and return its prior state.
    pub fn find_and_remove(&mut self, be_desc: &BackendDescriptor) -> BlacklistState {
        match self.entries.remove(&be_desc.backend_id) {
            Some(entry) => entry.state,
            None => BlacklistState::NotBlacklisted,
        }
    }

    pub fn is_blacklisted(&self, be_desc: &BackendDescriptor) -> bool {
        self.entries
            .get(&be_desc.backend_id)
            .map(|entry| entry.state == BlacklistState::Blacklisted)
            .unwrap_or(false)
    }

    pub fn is_on_probation(&self, be_desc: &BackendDescriptor) -> bool {
        self.entries
            .get(&be_desc.backend_id)
            .map(|entry| entry.state == BlacklistState::OnProbation)
            .unwrap_or(false)
    }

    /// True when `maintenance` has timeout work to do: a blacklisted entry is
    /// due for probation or a probation entry is due for removal.
    pub fn needs_maintenance(&self) -> bool {
        let now = Instant::now();
        self.entries.values().any(|entry| self.is_due(entry, now))
    }

    /// Apply timeout transitions. Backends newly placed on probation are
    /// appended to `probation_list` so the caller can re-add them to their
    /// executor groups.
    pub fn maintenance(&mut self, probation_list: &mut Vec<BackendDescriptor>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if entry.state == BlacklistState::Blacklisted
                && now.duration_since(entry.since) >= self.timeout
            {
                debug!("Executor {} passed blacklist timeout", entry.be_desc.address);
                entry.state = BlacklistState::OnProbation;
                entry.since = now;
                probation_list.push(entry.be_desc.clone());
            } else if entry.state == BlacklistState::OnProbation
                && now.duration_since(entry.since) >= self.timeout * PROBATION_TIMEOUT_MULTIPLIER
            {
                expired.push(key.clone());
            }
        }
        for key in expired {
            self.entries.remove(&key);
        }
    }

    fn is_due(&self, entry: &Entry, now: Instant) -> bool {
        match entry.state {
            BlacklistState::Blacklisted => now.duration_since(entry.since) >= self.timeout,
            BlacklistState::OnProbation => {
                now.duration_since(entry.since) >= self.timeout * PROBATION_TIMEOUT_MULTIPLIER
            }
            BlacklistState::NotBlacklisted => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BlacklistState, ExecutorBlacklist};
    use crate::common::types::NetworkAddress;
    use crate::service::statestore::BackendDescriptor;
    use std::time::Duration;

    fn executor(id: &str) -> BackendDescriptor {
        BackendDescriptor {
            address: NetworkAddress::new(id, 22000),
            ip_address: "10.0.0.1".to_string(),
            backend_id: id.to_string(),
            is_executor: true,
            is_coordinator: false,
            is_quiescing: false,
            executor_groups: vec![],
        }
    }

    #[test]
    fn blacklist_then_remove() {
        let mut blacklist = ExecutorBlacklist::new(Duration::from_secs(60));
        let be = executor("be-1");
        assert_eq!(blacklist.find_and_remove(&be), BlacklistState::NotBlacklisted);

        blacklist.blacklist(be.clone());
        assert!(blacklist.is_blacklisted(&be));
        assert_eq!(blacklist.find_and_remove(&be), BlacklistState::Blacklisted);
        assert!(!blacklist.is_blacklisted(&be));
        assert!(blacklist.is_empty());
    }

    #[test]
    fn maintenance_moves_timed_out_entries_to_probation() {
        let mut blacklist = ExecutorBlacklist::new(Duration::from_millis(0));
        let be = executor("be-1");
        blacklist.blacklist(be.clone());
        assert!(blacklist.needs_maintenance());

        let mut probation = Vec::new();
        blacklist.maintenance(&mut probation);
        assert_eq!(probation.len(), 1);
        assert!(blacklist.is_on_probation(&be));
        assert!(!blacklist.is_blacklisted(&be));

        // A second elapsed probation interval forgets the entry.
        let mut probation = Vec::new();
        blacklist.maintenance(&mut probation);
        assert!(probation.is_empty());
        assert!(blacklist.is_empty());
    }

    #[test]
    fn fresh_blacklist_needs_no_maintenance() {
        let mut blacklist = ExecutorBlacklist::new(Duration::from_secs(3600));
        blacklist.blacklist(executor("be-1"));
        assert!(!blacklist.needs_maintenance());
    }
}
