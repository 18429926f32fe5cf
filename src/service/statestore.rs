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
//! Statestore subscriber contract for the membership topic.
//!
//! Only the callback surface is modeled here; the gossip transport behind it
//! is an external collaborator. Topic values are serialized
//! `BackendDescriptor`s.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::status::Result;
use crate::common::types::NetworkAddress;

pub const MEMBERSHIP_TOPIC: &str = "cluster-membership";

#[derive(Clone, Debug, Default)]
pub struct TopicItem {
    pub key: String,
    pub value: Vec<u8>,
    pub deleted: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TopicDelta {
    pub topic_name: String,
    pub is_delta: bool,
    pub topic_entries: Vec<TopicItem>,
}

pub type TopicDeltaMap = HashMap<String, TopicDelta>;

/// Invoked on the subscriber's single worker thread; reentrancy is not
/// permitted. The callback may append its own outgoing deltas.
pub type UpdateCallback = Box<dyn Fn(&TopicDeltaMap, &mut Vec<TopicDelta>) + Send + Sync>;

pub trait StatestoreSubscriber: Send + Sync {
    fn add_topic(
        &self,
        topic_name: &str,
        is_transient: bool,
        populate_min_subscriber_topic_version: bool,
        filter_prefix: &str,
        cb: UpdateCallback,
    ) -> Result<()>;

    /// True while the subscriber is recovering from a connection failure and
    /// its post-recovery grace period has not elapsed.
    fn is_in_post_recovery_grace_period(&self) -> bool;
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutorGroupDesc {
    pub name: String,
    pub min_size: i64,
}

/// Identity and role of one backend as advertised on the membership topic.
/// Each backend resolves its own IP and transmits it inside the descriptor;
/// an empty `ip_address` marks a malformed entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub address: NetworkAddress,
    pub ip_address: String,
    pub backend_id: String,
    pub is_executor: bool,
    pub is_coordinator: bool,
    pub is_quiescing: bool,
    pub executor_groups: Vec<ExecutorGroupDesc>,
}

/// Failure here indicates a programmer error building the local descriptor,
/// so it is fatal for the process.
pub fn serialize_backend_descriptor(desc: &BackendDescriptor) -> Vec<u8> {
    serde_json::to_vec(desc).expect("serialize backend descriptor for statestore topic")
}

pub fn deserialize_backend_descriptor(
    bytes: &[u8],
) -> std::result::Result<BackendDescriptor, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_topic_value() {
        let desc = BackendDescriptor {
            address: NetworkAddress::new("host1", 22000),
            ip_address: "10.0.0.1".to_string(),
            backend_id: "be-1".to_string(),
            is_executor: true,
            is_coordinator: false,
            is_quiescing: false,
            executor_groups: vec![ExecutorGroupDesc {
                name: "default".to_string(),
                min_size: 1,
            }],
        };
        let bytes = serialize_backend_descriptor(&desc);
        let parsed = deserialize_backend_descriptor(&bytes).expect("deserialize");
        assert_eq!(parsed, desc);
    }

    #[test]
    fn garbage_value_is_an_error() {
        assert!(deserialize_backend_descriptor(b"not json").is_err());
    }
}
