// Copyright (c) 2026 Meshline
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Node configuration: `meshline.toml` on disk, with `MESHLINE_*` env vars
//! overriding the handful of settings operators most often need to change
//! per-deployment without touching the file (data directory, listen
//! address, bootstrap list).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("read config file")]
    Read,
    /// The config file's TOML couldn't be parsed into [`Config`].
    #[error("parse config: {0}")]
    Parse(String),
    /// An env var override held a value that doesn't parse.
    #[error("invalid env override {0}")]
    BadEnvOverride(&'static str),
}

/// Which communities this node auto-loads (and, if it is their master,
/// creates) at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommunityConfig {
    /// Free-form classification tag; selects the [`crate::core::community::MetaTemplate`]
    /// set this node hydrates the community with.
    pub classification: String,
    /// Hex-encoded Ed25519 public key of the community's master member. If
    /// absent, this node's own keystore key is used (i.e. this node is the
    /// community's master and creates it on first start).
    pub master_public_key: Option<String>,
}

/// Top-level node configuration, loaded from `meshline.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the keystore, sled store, and p2p identity.
    pub data_dir: String,
    /// libp2p listen multiaddr, e.g. `/ip4/0.0.0.0/tcp/7760`.
    pub listen_addr: String,
    /// Address the Prometheus metrics endpoint binds to.
    pub metrics_addr: String,
    /// Static bootstrap hosts, as `host:port` strings.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Optional path to a newline-delimited bootstrap host override file.
    pub bootstrap_file: Option<String>,
    /// Communities to auto-load (and possibly create) at startup.
    #[serde(default)]
    pub communities: Vec<CommunityConfig>,
    /// Gossipsub rendezvous topic used for bootstrap peer discovery.
    #[serde(default = "default_rendezvous_topic")]
    pub rendezvous_topic: String,
    /// Optional allowlist of peer ids (empty => allow all).
    #[serde(default)]
    pub allow_peers: Vec<String>,
}

fn default_rendezvous_topic() -> String {
    "meshline/rendezvous/1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: "data".to_string(),
            listen_addr: "/ip4/0.0.0.0/tcp/7760".to_string(),
            metrics_addr: "127.0.0.1:9760".to_string(),
            bootstrap: Vec::new(),
            bootstrap_file: None,
            communities: Vec::new(),
            rendezvous_topic: default_rendezvous_topic(),
            allow_peers: Vec::new(),
        }
    }
}

impl Config {
    /// Load `path` as TOML, falling back to [`Config::default`] if the file
    /// doesn't exist, then apply `MESHLINE_*` env var overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("MESHLINE_DATA_DIR") {
            if !v.trim().is_empty() {
                self.data_dir = v;
            }
        }
        if let Ok(v) = std::env::var("MESHLINE_LISTEN_ADDR") {
            if !v.trim().is_empty() {
                self.listen_addr = v;
            }
        }
        if let Ok(v) = std::env::var("MESHLINE_METRICS_ADDR") {
            if !v.trim().is_empty() {
                self.metrics_addr = v;
            }
        }
        if let Ok(v) = std::env::var("MESHLINE_BOOTSTRAP") {
            let hosts: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !hosts.is_empty() {
                self.bootstrap = hosts;
            }
        }
        Ok(())
    }

    /// `data_dir` as a [`PathBuf`], creating it if missing.
    pub fn data_dir_path(&self) -> Result<PathBuf, ConfigError> {
        let p = PathBuf::from(&self.data_dir);
        std::fs::create_dir_all(&p).map_err(|_| ConfigError::Read)?;
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load("/nonexistent/meshline.toml").unwrap();
        assert_eq!(cfg.listen_addr, "/ip4/0.0.0.0/tcp/7760");
    }

    #[test]
    fn parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshline.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/tmp/meshline-data"
listen_addr = "/ip4/0.0.0.0/tcp/4242"
metrics_addr = "127.0.0.1:9000"
bootstrap = ["seed1.example.org:7760", "seed2.example.org:7760"]

[[communities]]
classification = "chat"
"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.data_dir, "/tmp/meshline-data");
        assert_eq!(cfg.bootstrap.len(), 2);
        assert_eq!(cfg.communities[0].classification, "chat");
        assert!(cfg.communities[0].master_public_key.is_none());
    }

    #[test]
    fn env_override_beats_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshline.toml");
        std::fs::write(&path, "data_dir = \"/from/file\"\nlisten_addr = \"/ip4/0.0.0.0/tcp/1\"\nmetrics_addr = \"127.0.0.1:1\"\n").unwrap();
        std::env::set_var("MESHLINE_DATA_DIR", "/from/env");
        let cfg = Config::load(&path).unwrap();
        std::env::remove_var("MESHLINE_DATA_DIR");
        assert_eq!(cfg.data_dir, "/from/env");
    }
}
