//! Fleet-wide placement: pick a host and slot for a pipeline run using a
//! load-aware randomised policy (spec §4.5).

use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::config::RemoteHostsConfig;
use crate::remote_host::RemoteHost;
use crate::ssh::RetryingSessionFactory;

/// A successful acquisition. Releasing is the caller's responsibility;
/// there is no finaliser (spec §3).
pub struct Lease {
    host: Arc<RemoteHost>,
    pub host_platform: String,
    pub slot: u32,
    pub prid: String,
}

impl Lease {
    fn new(host: Arc<RemoteHost>, host_platform: impl Into<String>, slot: u32, prid: impl Into<String>) -> Self {
        Self {
            host,
            host_platform: host_platform.into(),
            slot,
            prid: prid.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        self.host.hostname()
    }

    /// Best-effort from the caller's point of view: the result is logged,
    /// never propagated (spec §4.5, §6).
    pub async fn unlock(&self) {
        let unlocked = self.host.unlock(self.slot, &self.prid).await;
        if !unlocked {
            log::warn!(
                "{}: release of slot {} for pipelinerun {} reported failure",
                self.host.hostname(),
                self.slot,
                self.prid
            );
        }
    }
}

/// A set of hosts filtered by platform and `enabled: true`. Lifetime
/// matches a single scheduling decision (spec §3).
pub struct RemoteHostsPool {
    hosts: Vec<Arc<RemoteHost>>,
    host_platform: String,
}

impl RemoteHostsPool {
    pub fn new(hosts: Vec<Arc<RemoteHost>>, host_platform: impl Into<String>) -> Self {
        Self {
            hosts,
            host_platform: host_platform.into(),
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Arc<RemoteHost>> {
        self.hosts.iter()
    }

    /// Builds a pool from the config-map shape in spec §4.5/§6. A missing
    /// `slots_dir` or an empty/missing platform pool is a fatal
    /// configuration error (E6); per-host `enabled: false` entries are
    /// dropped silently.
    pub fn from_config(config: &RemoteHostsConfig, platform: &str) -> crate::error::Result<Self> {
        let (slots_dir, host_configs) = config.hosts_for_platform(platform)?;

        let hosts = host_configs
            .into_iter()
            .map(|(hostname, attr)| {
                let factory = Arc::new(RetryingSessionFactory::new(hostname, attr.username, Path::new(&attr.auth)));
                Arc::new(RemoteHost::new(factory, attr.slots, attr.socket_path, Some(slots_dir.clone())))
            })
            .collect();

        Ok(Self::new(hosts, platform))
    }

    /// Picks a host and slot for `prid`. Returns `None` when every host is
    /// unreachable or out of capacity — the expected steady-state
    /// back-pressure signal (spec §4.5, §7, §8 items 7-9).
    pub async fn lock_resource(&self, prid: &str) -> Option<Lease> {
        let mut hosts = self.hosts.clone();
        hosts.shuffle(&mut rand::rng());

        let mut candidates: Vec<(Arc<RemoteHost>, Vec<u32>)> = Vec::new();
        for host in hosts {
            if !host.is_operational().await {
                continue;
            }
            let mut available_slots = match host.available_slots().await {
                Ok(slots) => slots,
                Err(err) => {
                    log::warn!("{}: unable to get available slots: {}", host.hostname(), err);
                    continue;
                }
            };
            if available_slots.is_empty() {
                log::info!("{}: no available slots", host.hostname());
                continue;
            }
            log::info!("{}: available slots: {:?}", host.hostname(), available_slots);
            available_slots.shuffle(&mut rand::rng());
            candidates.push((host, available_slots));
        }

        if candidates.is_empty() {
            log::error!("There is no remote host slot available for pipelinerun {prid}");
            return None;
        }

        // Emptier hosts first: spreads load across the fleet.
        candidates.sort_by(|a, b| {
            let ratio_a = a.1.len() as f64 / a.0.slots() as f64;
            let ratio_b = b.1.len() as f64 / b.0.slots() as f64;
            ratio_b.total_cmp(&ratio_a)
        });

        for (host, slots) in &candidates {
            for &slot in slots {
                if host.lock(slot, prid).await {
                    return Some(Lease::new(host.clone(), self.host_platform.clone(), slot, prid));
                }
            }
        }

        log::info!("Cannot find remote host resource for pipelinerun {prid}");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::{AlwaysFailingSessionFactory, FakeRemote, FakeSessionFactory, FlakySessionFactory};

    fn host(name: &str, remote: FakeRemote, slots: u32) -> Arc<RemoteHost> {
        let factory = Arc::new(FakeSessionFactory::new(name, remote));
        Arc::new(RemoteHost::new(factory, slots, "/run/podman/podman.sock", Some("/slots".to_string())))
    }

    /// Operational (its `mkdir -p` connect succeeds) but every later connect
    /// fails, so `available_slots` errors out instead of returning a list.
    fn flaky_host(name: &str, remote: FakeRemote, slots: u32) -> Arc<RemoteHost> {
        let factory = Arc::new(FlakySessionFactory::new(name, remote, 1));
        Arc::new(RemoteHost::new(factory, slots, "/run/podman/podman.sock", Some("/slots".to_string())))
    }

    fn unreachable_host(name: &str, slots: u32) -> Arc<RemoteHost> {
        let factory = Arc::new(AlwaysFailingSessionFactory::new(name));
        Arc::new(RemoteHost::new(factory, slots, "/run/podman/podman.sock", Some("/slots".to_string())))
    }

    #[tokio::test]
    async fn locks_a_slot_when_capacity_exists() {
        let remote = FakeRemote::new();
        let pool = RemoteHostsPool::new(vec![host("remote-host-001", remote.clone(), 3)], "x86_64");
        let lease = pool.lock_resource("pr123").await.expect("expected a lease");
        assert_eq!(lease.prid, "pr123");
        assert!((0..3).contains(&lease.slot));
        let locked_path = format!("/slots/slot_{}", lease.slot);
        assert!(remote.file(&locked_path).starts_with("pr123@"));
        lease.unlock().await;
        assert_eq!(remote.file(&locked_path), "");
    }

    #[tokio::test]
    async fn no_capacity_returns_none() {
        let remote = FakeRemote::new();
        remote.set_file("/slots/slot_0", "pr1@2022-02-15T10:12:13.780426");
        let pool = RemoteHostsPool::new(vec![host("remote-host-001", remote, 1)], "x86_64");
        assert!(pool.lock_resource("pr123").await.is_none());
    }

    #[tokio::test]
    async fn placement_favours_the_emptier_host() {
        let remote_a = FakeRemote::new();
        let remote_b = FakeRemote::new();
        // host B has only one free slot out of four; host A is fully free.
        for id in 1..4 {
            remote_b.set_file(&format!("/slots/slot_{id}"), "pr-occupant@2022-02-15T10:12:13.780426");
        }

        let mut wins_a = 0;
        for trial in 0..50 {
            let remote_a = remote_a.clone();
            let remote_b = remote_b.clone();
            let host_a = host("host-a", remote_a, 4);
            let host_b = host("host-b", remote_b, 4);
            let pool = RemoteHostsPool::new(vec![host_a, host_b], "x86_64");
            let lease = pool.lock_resource(&format!("pr{trial}")).await.expect("expected a lease");
            if lease.hostname() == "host-a" {
                wins_a += 1;
            }
            lease.unlock().await;
        }

        assert!(wins_a > 35, "expected host A to win the large majority of trials, got {wins_a}/50");
    }

    /// E5: a host whose `available_slots` call errors out (rather than
    /// returning an empty list) is skipped, not treated as fatal.
    #[tokio::test]
    async fn host_erroring_on_available_slots_is_skipped() {
        let remote = FakeRemote::new();
        let pool = RemoteHostsPool::new(vec![flaky_host("remote-host-001", remote, 3)], "x86_64");
        assert!(pool.lock_resource("pr123").await.is_none());
    }

    /// spec §8 item 9: one host erroring doesn't stop the pool from
    /// granting a lease on a healthy host.
    #[tokio::test]
    async fn a_failing_host_does_not_prevent_a_lease_on_a_healthy_host() {
        let remote_b = FakeRemote::new();
        let pool = RemoteHostsPool::new(
            vec![flaky_host("remote-host-001", FakeRemote::new(), 3), host("remote-host-002", remote_b.clone(), 3)],
            "x86_64",
        );
        let lease = pool.lock_resource("pr123").await.expect("healthy host should still grant a lease");
        assert_eq!(lease.hostname(), "remote-host-002");
        lease.unlock().await;
    }

    /// An entirely unreachable host (never operational) is likewise skipped
    /// rather than aborting the scheduling decision.
    #[tokio::test]
    async fn an_unreachable_host_does_not_prevent_a_lease_on_a_healthy_host() {
        let remote_b = FakeRemote::new();
        let pool = RemoteHostsPool::new(
            vec![unreachable_host("remote-host-001", 3), host("remote-host-002", remote_b.clone(), 3)],
            "x86_64",
        );
        let lease = pool.lock_resource("pr123").await.expect("healthy host should still grant a lease");
        assert_eq!(lease.hostname(), "remote-host-002");
        lease.unlock().await;
    }
}
