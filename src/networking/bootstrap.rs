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

//! Bootstrap peer discovery: a static `(host, port)` list, optionally
//! overridden from a file, resolved to live addresses and re-resolved on a
//! timer so a node keeps working after a bootstrap host's DNS changes.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::net::lookup_host;

/// Default interval between re-resolutions of bootstrap hostnames.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Bootstrap resolution failures.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The override file could not be read.
    #[error("read bootstrap file")]
    Read,
    /// A line in the override file isn't `host:port`.
    #[error("malformed bootstrap entry: {0}")]
    Malformed(String),
    /// DNS resolution failed for every configured host.
    #[error("no bootstrap address resolved")]
    NoneResolved,
}

/// One configured bootstrap entry, before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapHost {
    /// Hostname or IP literal.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl BootstrapHost {
    /// Parse a `host:port` line.
    pub fn parse(line: &str) -> Result<Self, BootstrapError> {
        let (host, port) = line
            .rsplit_once(':')
            .ok_or_else(|| BootstrapError::Malformed(line.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| BootstrapError::Malformed(line.to_string()))?;
        Ok(BootstrapHost {
            host: host.to_string(),
            port,
        })
    }
}

/// Load bootstrap hosts from a newline-delimited `host:port` file,
/// skipping blank lines and `#`-prefixed comments.
pub fn load_addresses_from_file(path: &std::path::Path) -> Result<Vec<BootstrapHost>, BootstrapError> {
    let raw = std::fs::read_to_string(path).map_err(|_| BootstrapError::Read)?;
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(BootstrapHost::parse)
        .collect()
}

/// Resolve `hosts` to live [`SocketAddr`]s: IP literals are used directly
/// (no DNS round trip), hostnames go through [`lookup_host`]. Unresolvable
/// entries are skipped rather than failing the whole batch; the call fails
/// only if nothing resolved at all.
pub async fn resolve(hosts: &[BootstrapHost]) -> Result<Vec<SocketAddr>, BootstrapError> {
    let mut out = Vec::new();
    for entry in hosts {
        if let Ok(ip) = entry.host.parse::<IpAddr>() {
            out.push(SocketAddr::new(ip, entry.port));
            continue;
        }
        if let Ok(addrs) = lookup_host((entry.host.as_str(), entry.port)).await {
            out.extend(addrs);
        }
    }
    if out.is_empty() {
        return Err(BootstrapError::NoneResolved);
    }
    Ok(out)
}

/// Resolve `hosts`, then shuffle the result so repeated bootstraps don't
/// all dial the same first address.
pub async fn resolve_shuffled(hosts: &[BootstrapHost]) -> Result<Vec<SocketAddr>, BootstrapError> {
    let mut addrs = resolve(hosts).await?;
    addrs.shuffle(&mut rand::thread_rng());
    Ok(addrs)
}

/// Runs [`resolve_shuffled`] on a fixed interval, handing each fresh
/// address list to `on_refresh`. Intended to be spawned as its own task;
/// never returns on its own.
pub async fn run_refresh_loop(
    hosts: Vec<BootstrapHost>,
    interval: Duration,
    mut on_refresh: impl FnMut(Vec<SocketAddr>),
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match resolve_shuffled(&hosts).await {
            Ok(addrs) => on_refresh(addrs),
            Err(e) => tracing::warn!(error = %e, "bootstrap refresh found no resolvable addresses"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let h = BootstrapHost::parse("example.org:7000").unwrap();
        assert_eq!(h.host, "example.org");
        assert_eq!(h.port, 7000);
    }

    #[test]
    fn parses_ip_literal_with_port() {
        let h = BootstrapHost::parse("10.0.0.1:7000").unwrap();
        assert_eq!(h.host, "10.0.0.1");
        assert_eq!(h.port, 7000);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(BootstrapHost::parse("example.org").is_err());
    }

    #[tokio::test]
    async fn resolves_ip_literal_without_dns() {
        let hosts = vec![BootstrapHost {
            host: "127.0.0.1".to_string(),
            port: 4242,
        }];
        let addrs = resolve(&hosts).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:4242".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn empty_host_list_fails() {
        let err = resolve(&[]).await.unwrap_err();
        assert!(matches!(err, BootstrapError::NoneResolved));
    }
}
