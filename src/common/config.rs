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
use crate::common::app_config::config as oryx_app_config;

pub(crate) fn batch_size() -> usize {
    oryx_app_config()
        .ok()
        .map(|c| c.runtime.batch_size)
        .unwrap_or(1024)
}

pub(crate) fn num_rows_produced_limit() -> i64 {
    oryx_app_config()
        .ok()
        .map(|c| c.runtime.num_rows_produced_limit)
        .unwrap_or(0)
}

pub(crate) fn blacklist_timeout_ms() -> u64 {
    oryx_app_config()
        .ok()
        .map(|c| c.membership.blacklist_timeout_ms)
        .unwrap_or(12_000)
}

pub(crate) fn executor_group_min_size() -> i64 {
    oryx_app_config()
        .ok()
        .map(|c| c.membership.executor_group_min_size)
        .unwrap_or(1)
}
