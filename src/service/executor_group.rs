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
//! A named set of executor backends eligible to run fragments together.
//!
//! Executors are keyed by resolved IP with a hostname side map, so lookups
//! accept either form of an address. Mutations guard against duplicates and
//! inconsistent group configuration instead of corrupting the map.

use std::collections::BTreeMap;

use crate::common::config;
use crate::common::logging::warn;
use crate::common::types::NetworkAddress;
use crate::service::statestore::{BackendDescriptor, ExecutorGroupDesc};

pub type IpAddr = String;
pub type Hostname = String;

#[derive(Clone, Debug)]
pub struct ExecutorGroup {
    name: String,
    min_size: i64,
    /// Backends per IP, in deterministic address order.
    executor_map: BTreeMap<IpAddr, Vec<BackendDescriptor>>,
    executor_ip_map: BTreeMap<Hostname, IpAddr>,
}

impl ExecutorGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_min_size(name, config::executor_group_min_size().max(1))
    }

    pub fn with_min_size(name: impl Into<String>, min_size: i64) -> Self {
        debug_assert!(min_size > 0);
        Self {
            name: name.into(),
            min_size,
            executor_map: BTreeMap::new(),
            executor_ip_map: BTreeMap::new(),
        }
    }

    pub fn from_desc(desc: &ExecutorGroupDesc) -> Self {
        Self::with_min_size(desc.name.clone(), desc.min_size.max(1))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_size(&self) -> i64 {
        self.min_size
    }

    pub fn add_executor(&mut self, be_desc: BackendDescriptor) {
        debug_assert!(!be_desc.ip_address.is_empty());
        if !self.check_consistency_or_warn(&be_desc) {
            warn!(
                "Ignoring inconsistent backend for executor group: {}",
                be_desc.address
            );
            return;
        }
        let be_descs = self.executor_map.entry(be_desc.ip_address.clone()).or_default();
        // IPs already match within the entry, so the port identifies the backend.
        if be_descs
            .iter()
            .any(|existing| existing.address.port == be_desc.address.port)
        {
            warn!(
                "Tried to add existing backend to executor group {}: {}",
                self.name, be_desc.address
            );
            return;
        }
        self.executor_ip_map
            .insert(be_desc.address.hostname.clone(), be_desc.ip_address.clone());
        be_descs.push(be_desc);
    }

    pub fn remove_executor(&mut self, be_desc: &BackendDescriptor) {
        let Some(be_descs) = self.executor_map.get_mut(&be_desc.ip_address) else {
            warn!(
                "Tried to remove a backend from non-existing host: {}",
                be_desc.address
            );
            return;
        };
        let Some(pos) = be_descs
            .iter()
            .position(|existing| existing.address.port == be_desc.address.port)
        else {
            warn!(
                "Tried to remove non-existing backend from per-host list: {}",
                be_desc.address
            );
            return;
        };
        be_descs.remove(pos);
        if be_descs.is_empty() {
            self.executor_map.remove(&be_desc.ip_address);
            self.executor_ip_map.remove(&be_desc.address.hostname);
        }
    }

    /// Resolve a hostname (or an IP given as hostname) to the IP executors are
    /// keyed under.
    pub fn look_up_executor_ip(&self, hostname: &str) -> Option<IpAddr> {
        if self.executor_map.contains_key(hostname) {
            return Some(hostname.to_string());
        }
        self.executor_ip_map.get(hostname).cloned()
    }

    pub fn look_up_backend_desc(&self, host: &NetworkAddress) -> Option<&BackendDescriptor> {
        let ip = self.look_up_executor_ip(&host.hostname)?;
        self.executor_map
            .get(&ip)?
            .iter()
            .find(|desc| desc.address == *host)
    }

    pub fn get_all_executor_descriptors(&self) -> Vec<&BackendDescriptor> {
        self.executor_map.values().flatten().collect()
    }

    pub fn num_executors(&self) -> usize {
        self.executor_map.values().map(Vec::len).sum()
    }

    pub fn num_hosts(&self) -> usize {
        self.executor_map.len()
    }

    pub fn is_healthy(&self) -> bool {
        let num_executors = self.num_executors();
        if (num_executors as i64) < self.min_size {
            warn!(
                "Executor group {} is unhealthy: {} out of {} are available.",
                self.name, num_executors, self.min_size
            );
            return false;
        }
        true
    }

    /// A backend that mentions this group must agree on the minimum size.
    /// Backends that do not mention the group are considered consistent so
    /// they can be added to unrelated groups, e.g. coordinator-only
    /// scheduling.
    fn check_consistency_or_warn(&self, be_desc: &BackendDescriptor) -> bool {
        for desc in &be_desc.executor_groups {
            if desc.name == self.name {
                if desc.min_size.max(1) == self.min_size {
                    return true;
                }
                warn!(
                    "Backend {} is configured for executor group {} with minimum size {} but group has minimum size {}",
                    be_desc.address, desc.name, desc.min_size, self.min_size
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutorGroup;
    use crate::common::types::NetworkAddress;
    use crate::service::statestore::{BackendDescriptor, ExecutorGroupDesc};

    fn executor(host: &str, ip: &str, port: u16) -> BackendDescriptor {
        BackendDescriptor {
            address: NetworkAddress::new(host, port),
            ip_address: ip.to_string(),
            backend_id: format!("{}:{}", host, port),
            is_executor: true,
            is_coordinator: false,
            is_quiescing: false,
            executor_groups: vec![ExecutorGroupDesc {
                name: "default".to_string(),
                min_size: 1,
            }],
        }
    }

    #[test]
    fn add_remove_and_lookup() {
        let mut group = ExecutorGroup::new("default");
        let be = executor("host1", "10.0.0.1", 22000);
        group.add_executor(be.clone());
        assert_eq!(group.num_executors(), 1);
        assert_eq!(group.num_hosts(), 1);
        assert!(group.look_up_backend_desc(&be.address).is_some());
        assert_eq!(
            group.look_up_executor_ip("host1").as_deref(),
            Some("10.0.0.1")
        );

        group.remove_executor(&be);
        assert_eq!(group.num_executors(), 0);
        assert!(group.look_up_backend_desc(&be.address).is_none());
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mut group = ExecutorGroup::new("default");
        let be = executor("host1", "10.0.0.1", 22000);
        group.add_executor(be.clone());
        group.add_executor(be);
        assert_eq!(group.num_executors(), 1);
    }

    #[test]
    fn two_backends_one_host() {
        let mut group = ExecutorGroup::new("default");
        group.add_executor(executor("host1", "10.0.0.1", 22000));
        group.add_executor(executor("host1", "10.0.0.1", 22001));
        assert_eq!(group.num_executors(), 2);
        assert_eq!(group.num_hosts(), 1);
    }

    #[test]
    fn health_tracks_min_size() {
        let mut group = ExecutorGroup::with_min_size("pool", 2);
        let mut be = executor("host1", "10.0.0.1", 22000);
        be.executor_groups = vec![ExecutorGroupDesc {
            name: "pool".to_string(),
            min_size: 2,
        }];
        group.add_executor(be);
        assert!(!group.is_healthy());
        assert_eq!(group.num_hosts(), 1);
    }

    #[test]
    fn inconsistent_min_size_is_rejected() {
        let mut group = ExecutorGroup::with_min_size("pool", 2);
        let mut be = executor("host1", "10.0.0.1", 22000);
        be.executor_groups = vec![ExecutorGroupDesc {
            name: "pool".to_string(),
            min_size: 3,
        }];
        group.add_executor(be);
        assert_eq!(group.num_executors(), 0);
    }
}
