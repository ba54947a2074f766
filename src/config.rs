//! Typed view over the config-map shape consumed by [`crate::pool::RemoteHostsPool`]
//! (spec §4.5, §6).

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{RemoteHostError, Result};

fn default_slots() -> u32 {
    1
}

/// One entry under `pools.<platform>.<hostname>`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub enabled: bool,
    pub auth: String,
    pub username: String,
    #[serde(default = "default_slots")]
    pub slots: u32,
    pub socket_path: String,
}

/// The whole config map: `slots_dir` plus `pools.<platform>.<hostname>`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteHostsConfig {
    pub slots_dir: Option<String>,
    #[serde(default)]
    pub pools: HashMap<String, HashMap<String, HostConfig>>,
}

impl RemoteHostsConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| RemoteHostError::InvalidArgument {
            message: format!("cannot parse remote hosts config: {err}"),
        })
    }

    /// Hosts enabled for `platform`. Errors when `slots_dir` or the
    /// platform's pool is missing/empty (spec §4.5, E6).
    pub fn hosts_for_platform(&self, platform: &str) -> Result<(String, Vec<(String, HostConfig)>)> {
        let slots_dir = self.slots_dir.clone().ok_or_else(|| RemoteHostError::InvalidArgument {
            message: "Slots dir is missing from remote hosts config".to_string(),
        })?;

        let platform_pool = self.pools.get(platform).ok_or_else(|| RemoteHostError::InvalidArgument {
            message: format!("No remote hosts found in config for platform {platform}"),
        })?;
        if platform_pool.is_empty() {
            return Err(RemoteHostError::InvalidArgument {
                message: format!("No remote hosts found in config for platform {platform}"),
            });
        }

        let hosts = platform_pool
            .iter()
            .filter(|(_, attr)| attr.enabled)
            .map(|(hostname, attr)| (hostname.clone(), attr.clone()))
            .collect();

        Ok((slots_dir, hosts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        slots_dir = "/home/builder/osbs_slots"

        [pools.x86_64.remote-host-001]
        enabled = true
        auth = "/secrets/remote-host-001"
        username = "cloud-user"
        slots = 3
        socket_path = "/run/podman/podman.sock"

        [pools.x86_64.remote-host-002]
        enabled = false
        auth = "/secrets/remote-host-002"
        username = "cloud-user"
        socket_path = "/run/podman/podman.sock"
    "#;

    #[test]
    fn disabled_hosts_are_filtered_and_defaults_apply() {
        let config = RemoteHostsConfig::from_toml(SAMPLE).unwrap();
        let (slots_dir, hosts) = config.hosts_for_platform("x86_64").unwrap();
        assert_eq!(slots_dir, "/home/builder/osbs_slots");
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].0, "remote-host-001");
        assert_eq!(hosts[0].1.slots, 3);
    }

    #[test]
    fn missing_slots_dir_is_a_fatal_config_error() {
        let config = RemoteHostsConfig::from_toml("pools.x86_64.h = {}").unwrap_err();
        assert!(matches!(config, RemoteHostError::InvalidArgument { .. }));
    }

    #[test]
    fn missing_platform_is_a_fatal_config_error() {
        let config = RemoteHostsConfig::from_toml(SAMPLE).unwrap();
        assert!(config.hosts_for_platform("ppc64le").is_err());
    }
}
