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
//! Copy-on-write view of cluster membership driven by the statestore.
//!
//! Writers rebuild a snapshot under `update_membership_lock` and publish it
//! with a shared-pointer swap; readers grab the pointer and read lock-free for
//! as long as they like. Published snapshots are never mutated. While the
//! statestore subscriber is inside its post-recovery grace period, rebuilt
//! snapshots accumulate in a private recovering slot and only the last one is
//! published once the grace period ends.
//!
//! Lock order: `update_membership_lock`, then `callback_fn_lock`, then
//! `current_membership_lock`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::logging::{debug, info, warn};
use crate::common::metrics::{MetricsRegistry, global_metrics};
use crate::common::status::{Result, Status};
use crate::common::types::NetworkAddress;
use crate::service::executor_blacklist::{BlacklistState, ExecutorBlacklist};
use crate::service::executor_group::ExecutorGroup;
use crate::service::statestore::{
    BackendDescriptor, ExecutorGroupDesc, MEMBERSHIP_TOPIC, StatestoreSubscriber, TopicDelta,
    TopicDeltaMap, TopicItem, UpdateCallback, deserialize_backend_descriptor,
    serialize_backend_descriptor,
};

pub type BackendIdMap = HashMap<String, BackendDescriptor>;
pub type ExecutorGroups = BTreeMap<String, ExecutorGroup>;
pub type BackendAddressSet = BTreeSet<NetworkAddress>;
pub type SnapshotPtr = Arc<Snapshot>;

pub type BackendDescriptorPtrFn = Box<dyn Fn() -> Option<Arc<BackendDescriptor>> + Send>;
pub type UpdateLocalServerFn = Box<dyn Fn(&BackendAddressSet) + Send>;
pub type UpdateFrontendFn = Box<dyn Fn(&UpdateExecutorMembershipRequest) -> Result<()> + Send>;

/// Executor summary pushed to the planner after a snapshot change. The
/// planner's view is advisory; the scheduler always consults the snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateExecutorMembershipRequest {
    pub hostnames: BTreeSet<String>,
    pub ip_addresses: BTreeSet<String>,
    pub num_executors: i64,
}

/// Immutable-after-publish membership state.
#[derive(Clone, Default)]
pub struct Snapshot {
    pub version: i64,
    pub local_be_desc: Option<Arc<BackendDescriptor>>,
    pub current_backends: BackendIdMap,
    pub executor_groups: ExecutorGroups,
    pub executor_blacklist: ExecutorBlacklist,
}

#[derive(Default)]
struct CallbackFns {
    local_be_desc_fn: Option<BackendDescriptorPtrFn>,
    update_local_server_fn: Option<UpdateLocalServerFn>,
    update_frontend_fn: Option<UpdateFrontendFn>,
}

/// Scratch state owned by writers; guarded by `update_membership_lock`.
#[derive(Default)]
struct WriterState {
    /// Snapshot built while the subscriber was in its post-recovery grace
    /// period. Never exposed to readers.
    recovering_membership: Option<Snapshot>,
}

pub struct ClusterMembershipMgr {
    local_backend_id: String,
    statestore_subscriber: Option<Arc<dyn StatestoreSubscriber>>,
    metrics: MetricsRegistry,
    update_membership_lock: Mutex<WriterState>,
    callback_fn_lock: Mutex<CallbackFns>,
    current_membership_lock: Mutex<SnapshotPtr>,
}

/// Find the group named in `desc`, creating it if this is the first reference.
fn find_or_insert_executor_group<'a>(
    desc: &ExecutorGroupDesc,
    executor_groups: &'a mut ExecutorGroups,
) -> &'a mut ExecutorGroup {
    executor_groups
        .entry(desc.name.clone())
        .or_insert_with(|| ExecutorGroup::from_desc(desc))
}

impl ClusterMembershipMgr {
    pub fn new(
        local_backend_id: impl Into<String>,
        statestore_subscriber: Option<Arc<dyn StatestoreSubscriber>>,
    ) -> Self {
        Self::with_metrics(local_backend_id, statestore_subscriber, global_metrics().clone())
    }

    pub fn with_metrics(
        local_backend_id: impl Into<String>,
        statestore_subscriber: Option<Arc<dyn StatestoreSubscriber>>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            local_backend_id: local_backend_id.into(),
            statestore_subscriber,
            metrics,
            update_membership_lock: Mutex::new(WriterState::default()),
            callback_fn_lock: Mutex::new(CallbackFns::default()),
            current_membership_lock: Mutex::new(Arc::new(Snapshot::default())),
        }
    }

    /// Register the membership-topic callback with the statestore subscriber.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        info!("Starting cluster membership manager");
        let Some(subscriber) = self.statestore_subscriber.as_ref() else {
            return Ok(());
        };
        let mgr = Arc::clone(self);
        let cb: UpdateCallback =
            Box::new(move |deltas, updates| mgr.update_membership(deltas, updates));
        subscriber
            .add_topic(
                MEMBERSHIP_TOPIC,
                /* is_transient= */ true,
                /* populate_min_subscriber_topic_version= */ false,
                /* filter_prefix= */ "",
                cb,
            )
            .map_err(|e| {
                Status::internal(format!("failed to register membership topic: {}", e))
            })?;
        Ok(())
    }

    /// Install the local-descriptor provider. Must be set exactly once,
    /// before updates flow.
    pub fn set_local_be_desc_fn(&self, f: BackendDescriptorPtrFn) {
        let mut fns = self.lock_callbacks();
        debug_assert!(fns.local_be_desc_fn.is_none());
        fns.local_be_desc_fn = Some(f);
    }

    pub fn set_update_local_server_fn(&self, f: UpdateLocalServerFn) {
        let mut fns = self.lock_callbacks();
        debug_assert!(fns.update_local_server_fn.is_none());
        fns.update_local_server_fn = Some(f);
    }

    pub fn set_update_frontend_fn(&self, f: UpdateFrontendFn) {
        let mut fns = self.lock_callbacks();
        debug_assert!(fns.update_frontend_fn.is_none());
        fns.update_frontend_fn = Some(f);
    }

    /// Immutable snapshot pointer, suitable for long reads.
    pub fn get_snapshot(&self) -> SnapshotPtr {
        Arc::clone(&self.current_membership_lock.lock().expect("current membership lock"))
    }

    /// Statestore callback. Applies one topic update, rebuilds the snapshot
    /// copy-on-write, and publishes it unless the subscriber is still in its
    /// post-recovery grace period.
    pub fn update_membership(
        &self,
        incoming_topic_deltas: &TopicDeltaMap,
        subscriber_topic_updates: &mut Vec<TopicDelta>,
    ) {
        let mut writer = self
            .update_membership_lock
            .lock()
            .expect("update membership lock");

        // Ignore spurious messages.
        let Some(update) = incoming_topic_deltas.get(MEMBERSHIP_TOPIC) else {
            return;
        };

        let no_ss_update = update.is_delta && update.topic_entries.is_empty();

        let current = self.get_snapshot();
        let base_snapshot: &Snapshot = writer.recovering_membership.as_ref().unwrap_or(&*current);
        let local_be_desc = self.get_local_backend_descriptor();
        let needs_local_be_update = self.needs_local_backend_update(base_snapshot, &local_be_desc);

        let ss_is_recovering = self
            .statestore_subscriber
            .as_ref()
            .map(|s| s.is_in_post_recovery_grace_period())
            .unwrap_or(false);

        // If we were tracking a recovering membership and the subscriber has
        // left its grace period, the local server must hear about the pending
        // snapshot.
        let mut update_local_server =
            writer.recovering_membership.is_some() && !ss_is_recovering;

        let needs_blacklist_maintenance = base_snapshot.executor_blacklist.needs_maintenance();

        // Nothing to apply: skip without copying the state.
        if no_ss_update
            && !needs_local_be_update
            && !update_local_server
            && !needs_blacklist_maintenance
        {
            return;
        }

        if !no_ss_update {
            debug!("Processing statestore update");
        }
        if needs_local_be_update {
            debug!("Local backend membership needs update");
        }
        if update_local_server {
            debug!("Local server needs update");
        }
        if needs_blacklist_maintenance {
            debug!("Removing executors from the blacklist");
        }
        if ss_is_recovering {
            debug!("Statestore subscriber is in post-recovery grace period");
        }

        let base_version = base_snapshot.version;
        let mut new_state: Snapshot;
        if !update.is_delta {
            debug!("Received full membership update");
            // Full topic transmit, create fresh state. A full update could
            // remove backends, so the local server must be notified.
            new_state = Snapshot {
                version: base_version,
                ..Snapshot::default()
            };
            update_local_server = true;
        } else {
            debug!("Received delta membership update");
            // The recovering membership is never exposed and needs no copy;
            // otherwise copy the published snapshot.
            new_state = match writer.recovering_membership.take() {
                Some(recovering) => recovering,
                None => (*current).clone(),
            };
        }
        if let Some(local) = &local_be_desc {
            new_state.local_be_desc = Some(Arc::clone(local));
        }
        new_state.version += 1;

        for item in &update.topic_entries {
            if item.deleted {
                self.apply_deleted_item(item, &mut new_state, &mut update_local_server);
                continue;
            }

            let be_desc = match deserialize_backend_descriptor(&item.value) {
                Ok(desc) => desc,
                Err(err) => {
                    warn!(
                        "Error deserializing membership topic item with key {}: {}",
                        item.key, err
                    );
                    continue;
                }
            };
            if be_desc.ip_address.is_empty() {
                // Each backend resolves its own IP and transmits it in the
                // descriptor; an empty one is a malformed entry.
                warn!(
                    "Ignoring membership entry with empty IP address from subscriber: {}",
                    be_desc.address
                );
                continue;
            }
            if item.key == self.local_backend_id {
                // The local entry is always re-applied from the locally
                // supplied descriptor below; only log oddities here.
                match &local_be_desc {
                    None => warn!(
                        "Another host registered itself with the local backend id ({}), but the local backend has not started yet. The offending address is: {}",
                        item.key, be_desc.address
                    ),
                    Some(local) if be_desc.address != local.address => warn!(
                        "Duplicate subscriber registration from address: {} (we are: {}, backend id: {})",
                        be_desc.address, local.address, item.key
                    ),
                    _ => {}
                }
                continue;
            }

            self.apply_backend_item(&item.key, be_desc, &mut new_state);
            debug_assert!(Self::check_consistency(&new_state));
        }

        if needs_blacklist_maintenance {
            // Re-add backends that moved from the blacklist onto probation.
            let mut probation_list = Vec::new();
            new_state.executor_blacklist.maintenance(&mut probation_list);
            for be_desc in &probation_list {
                for group in &be_desc.executor_groups {
                    debug!(
                        "Adding backend {} to group {} (passed blacklist timeout)",
                        be_desc.address, group.name
                    );
                    find_or_insert_executor_group(group, &mut new_state.executor_groups)
                        .add_executor(be_desc.clone());
                }
            }
            debug_assert!(Self::check_consistency(&new_state));
        }

        // Re-check against the new state: a full transmit resets it above.
        if self.needs_local_backend_update(&new_state, &local_be_desc) {
            let local = local_be_desc.as_ref().expect("local backend descriptor");
            new_state
                .current_backends
                .insert(self.local_backend_id.clone(), (**local).clone());
            for group in &local.executor_groups {
                if local.is_quiescing {
                    debug!("Removing local backend from group {}", group.name);
                    find_or_insert_executor_group(group, &mut new_state.executor_groups)
                        .remove_executor(local);
                } else if local.is_executor {
                    debug!("Adding local backend to group {}", group.name);
                    find_or_insert_executor_group(group, &mut new_state.executor_groups)
                        .add_executor((**local).clone());
                }
            }
            self.add_local_backend_to_statestore(local, subscriber_topic_updates);
            debug_assert!(Self::check_consistency(&new_state));
        }

        self.update_metrics(&new_state);

        // Don't publish or send notifications while the subscriber is inside
        // its post-recovery grace period.
        if ss_is_recovering {
            writer.recovering_membership = Some(new_state);
            return;
        }

        if update_local_server {
            self.notify_local_server_for_deleted_backend(&new_state.current_backends);
        }
        self.update_frontend_executor_membership(&new_state.current_backends);

        self.set_state(Arc::new(new_state));
        writer.recovering_membership = None;
    }

    /// Hide `be_desc` from scheduling after a coordinator-observed failure.
    /// Neither the local server nor the frontend is notified: the backend may
    /// still be running its queries, and the planner's executor view is only
    /// a hint.
    pub fn blacklist_executor(&self, be_desc: &BackendDescriptor) {
        let mut writer = self
            .update_membership_lock
            .lock()
            .expect("update membership lock");
        let current = self.get_snapshot();

        // Never blacklist the local backend: coordinator fragments must be
        // schedulable on this host.
        if let Some(local) = current.local_be_desc.as_ref() {
            if be_desc.ip_address == local.ip_address
                && be_desc.address.port == local.address.port
            {
                return;
            }
        }

        let recovering = writer.recovering_membership.is_some();
        let base_snapshot: &Snapshot = writer.recovering_membership.as_ref().unwrap_or(&*current);

        // Check the snapshot we'd be updating before copying it: the backend
        // may already be gone (removed by a statestore update or quiescing).
        let exists = be_desc.executor_groups.iter().any(|group| {
            base_snapshot
                .executor_groups
                .get(&group.name)
                .and_then(|g| g.look_up_backend_desc(&be_desc.address))
                .is_some()
        });
        if !exists {
            return;
        }

        let mut new_state = match writer.recovering_membership.take() {
            Some(recovering_state) => recovering_state,
            None => (*current).clone(),
        };
        new_state.version += 1;

        for group in &be_desc.executor_groups {
            debug!(
                "Removing backend {} from group {} (blacklisted)",
                be_desc.address, group.name
            );
            find_or_insert_executor_group(group, &mut new_state.executor_groups)
                .remove_executor(be_desc);
        }
        new_state.executor_blacklist.blacklist(be_desc.clone());
        debug_assert!(Self::check_consistency(&new_state));

        // Publication happens once the subscriber leaves recovery.
        if recovering {
            writer.recovering_membership = Some(new_state);
            return;
        }
        self.set_state(Arc::new(new_state));
    }

    fn apply_deleted_item(
        &self,
        item: &TopicItem,
        new_state: &mut Snapshot,
        update_local_server: &mut bool,
    ) {
        let Some(be_desc) = new_state.current_backends.get(&item.key).cloned() else {
            return;
        };
        let was_blacklisted = new_state.executor_blacklist.find_and_remove(&be_desc)
            == BlacklistState::Blacklisted;
        // A quiescing or blacklisted backend has already left its groups.
        if be_desc.is_executor && !be_desc.is_quiescing && !was_blacklisted {
            for group in &be_desc.executor_groups {
                debug!(
                    "Removing backend {} from group {} (deleted)",
                    item.key, group.name
                );
                find_or_insert_executor_group(group, &mut new_state.executor_groups)
                    .remove_executor(&be_desc);
            }
        }
        new_state.current_backends.remove(&item.key);
        *update_local_server = true;
    }

    fn apply_backend_item(&self, key: &str, be_desc: BackendDescriptor, new_state: &mut Snapshot) {
        if let Some(existing) = new_state.current_backends.get(key).cloned() {
            // Update. A statestore update for the backend implies it is
            // alive, so any blacklist entry is dropped.
            let was_blacklisted = new_state.executor_blacklist.find_and_remove(&be_desc)
                == BlacklistState::Blacklisted;
            if be_desc.is_quiescing
                && !existing.is_quiescing
                && existing.is_executor
                && !was_blacklisted
            {
                for group in &be_desc.executor_groups {
                    debug!(
                        "Removing backend {} from group {} (quiescing)",
                        key, group.name
                    );
                    find_or_insert_executor_group(group, &mut new_state.executor_groups)
                        .remove_executor(&be_desc);
                }
            }
            new_state.current_backends.insert(key.to_string(), be_desc);
        } else {
            // Create. A new backend cannot already be blacklisted or on
            // probation.
            debug_assert_eq!(
                new_state.executor_blacklist.find_and_remove(&be_desc),
                BlacklistState::NotBlacklisted
            );
            if !be_desc.is_quiescing && be_desc.is_executor {
                for group in &be_desc.executor_groups {
                    debug!("Adding backend {} to group {}", key, group.name);
                    find_or_insert_executor_group(group, &mut new_state.executor_groups)
                        .add_executor(be_desc.clone());
                }
            }
            new_state.current_backends.insert(key.to_string(), be_desc);
        }
    }

    /// Advertise the local descriptor on the membership topic.
    fn add_local_backend_to_statestore(
        &self,
        local_be_desc: &BackendDescriptor,
        subscriber_topic_updates: &mut Vec<TopicDelta>,
    ) {
        debug!("Sending local backend to statestore");
        let value = serialize_backend_descriptor(local_be_desc);
        subscriber_topic_updates.push(TopicDelta {
            topic_name: MEMBERSHIP_TOPIC.to_string(),
            is_delta: true,
            topic_entries: vec![TopicItem {
                key: self.local_backend_id.clone(),
                value,
                deleted: false,
            }],
        });
    }

    fn get_local_backend_descriptor(&self) -> Option<Arc<BackendDescriptor>> {
        let fns = self.lock_callbacks();
        fns.local_be_desc_fn.as_ref().and_then(|f| f())
    }

    fn notify_local_server_for_deleted_backend(&self, current_backends: &BackendIdMap) {
        let fns = self.lock_callbacks();
        let Some(update_fn) = fns.update_local_server_fn.as_ref() else {
            return;
        };
        let current_backend_set: BackendAddressSet = current_backends
            .values()
            .map(|desc| desc.address.clone())
            .collect();
        update_fn(&current_backend_set);
    }

    fn update_frontend_executor_membership(&self, current_backends: &BackendIdMap) {
        let fns = self.lock_callbacks();
        let Some(update_fn) = fns.update_frontend_fn.as_ref() else {
            return;
        };
        let mut request = UpdateExecutorMembershipRequest::default();
        for backend in current_backends.values() {
            if backend.is_executor {
                request.hostnames.insert(backend.address.hostname.clone());
                request.ip_addresses.insert(backend.ip_address.clone());
                request.num_executors += 1;
            }
        }
        if let Err(status) = update_fn(&request) {
            warn!("Error updating frontend membership snapshot: {}", status);
        }
    }

    fn set_state(&self, new_state: SnapshotPtr) {
        let mut current = self
            .current_membership_lock
            .lock()
            .expect("current membership lock");
        *current = new_state;
    }

    fn needs_local_backend_update(
        &self,
        state: &Snapshot,
        local_be_desc: &Option<Arc<BackendDescriptor>>,
    ) -> bool {
        let Some(local) = local_be_desc else {
            return false;
        };
        if state.local_be_desc.is_none() {
            return true;
        }
        match state.current_backends.get(&self.local_backend_id) {
            None => true,
            Some(existing) => existing.is_quiescing != local.is_quiescing,
        }
    }

    /// Every backend in any group must be present in `current_backends`, be an
    /// executor, not be quiescing, not be blacklisted, and agree with the
    /// registered descriptor on the executor/quiescing flags. Violations are
    /// programmer errors.
    fn check_consistency(state: &Snapshot) -> bool {
        let mut address_to_backend: HashMap<&NetworkAddress, &BackendDescriptor> = HashMap::new();
        for desc in state.current_backends.values() {
            address_to_backend.insert(&desc.address, desc);
        }

        for (group_name, group) in &state.executor_groups {
            for group_be in group.get_all_executor_descriptors() {
                if !group_be.is_executor {
                    warn!(
                        "Backend {} in group {} is not an executor",
                        group_be.address, group_name
                    );
                    return false;
                }
                if group_be.is_quiescing {
                    warn!(
                        "Backend {} in group {} is quiescing",
                        group_be.address, group_name
                    );
                    return false;
                }
                let Some(current_be) = address_to_backend.get(&group_be.address) else {
                    warn!(
                        "Backend {} is in group {} but not in current set of backends",
                        group_be.address, group_name
                    );
                    return false;
                };
                if current_be.is_quiescing != group_be.is_quiescing
                    || current_be.is_executor != group_be.is_executor
                {
                    warn!(
                        "Backend {} in group {} differs from backend in current set of backends",
                        group_be.address, group_name
                    );
                    return false;
                }
                if state.executor_blacklist.is_blacklisted(group_be) {
                    warn!(
                        "Backend {} in group {} is blacklisted",
                        group_be.address, group_name
                    );
                    return false;
                }
            }
        }
        true
    }

    fn update_metrics(&self, state: &Snapshot) {
        let mut total_live = 0i64;
        let mut total_healthy = 0i64;
        for group in state.executor_groups.values() {
            if group.is_healthy() {
                total_live += 1;
                total_healthy += 1;
            } else if group.num_hosts() > 0 {
                total_live += 1;
            }
        }
        debug_assert!(total_healthy <= total_live);
        self.metrics.set_cluster_membership(
            total_live,
            total_healthy,
            state.current_backends.len() as i64,
        );
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, CallbackFns> {
        self.callback_fn_lock.lock().expect("callback fn lock")
    }
}
