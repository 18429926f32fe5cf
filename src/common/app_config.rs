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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<OryxConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static OryxConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = OryxConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static OryxConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = OryxConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static OryxConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("ORYXDB_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("oryxdb.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $ORYXDB_CONFIG or create ./oryxdb.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct OryxConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression. If set, this takes
    /// precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub membership: MembershipConfig,
}

impl OryxConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: OryxConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}

impl Default for OryxConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
            membership: MembershipConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_be_port")]
    pub be_port: u16,
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_be_port() -> u16 {
    22000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            be_port: default_be_port(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Preferred number of rows per batch flowing through the executor.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-query cap on rows handed to the client. 0 disables the cap.
    #[serde(default)]
    pub num_rows_produced_limit: i64,
}

fn default_batch_size() -> usize {
    1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_rows_produced_limit: 0,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct MembershipConfig {
    /// Base duration a blacklisted executor stays hidden before it is put on
    /// probation, in milliseconds.
    #[serde(default = "default_blacklist_timeout_ms")]
    pub blacklist_timeout_ms: u64,

    /// Default minimum healthy size for executor groups that do not carry one.
    #[serde(default = "default_group_min_size")]
    pub executor_group_min_size: i64,
}

fn default_blacklist_timeout_ms() -> u64 {
    12_000
}

fn default_group_min_size() -> i64 {
    1
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            blacklist_timeout_ms: default_blacklist_timeout_ms(),
            executor_group_min_size: default_group_min_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OryxConfig;

    #[test]
    fn default_config_is_usable() {
        let cfg = OryxConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.runtime.batch_size, 1024);
        assert_eq!(cfg.membership.executor_group_min_size, 1);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: OryxConfig = toml::from_str(
            r#"
            log_level = "debug"

            [membership]
            blacklist_timeout_ms = 5000
            "#,
        )
        .expect("parse toml");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.membership.blacklist_timeout_ms, 5000);
        assert_eq!(cfg.runtime.num_rows_produced_limit, 0);
    }
}
