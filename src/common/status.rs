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
//! Execution status codes shared by the runtime, sink and hash-table paths.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Status {
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Memory limit exceeded: {0}")]
    MemLimitExceeded(String),

    #[error("Rows produced limit exceeded: query produced {produced} rows, limit is {limit}")]
    RowsProducedLimitExceeded { produced: i64, limit: i64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Status {
    pub fn cancelled() -> Self {
        Status::Cancelled("Cancelled".to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Status::Cancelled(_))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Status::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Status>;
