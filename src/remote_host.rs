//! A single remote build host: its identity, slot count, and the
//! two-session advisory lock protocol used to mutate one of its slots
//! (spec §4.4).
//!
//! The remote side runs no daemon beyond `sshd`; mutual exclusion is
//! `flock(1)` held open over a kept-alive SSH command channel.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use tokio::sync::OnceCell;

use crate::error::{RemoteHostError, Result};
use crate::host_slot::HostSlot;
use crate::retry;
use crate::ssh::{LockChannel, SessionFactory, ShellSession};

const SLOTS_RELATIVE_PATH: &str = "osbs_slots";
const LOCK_SPAWN_DELAY: Duration = Duration::from_millis(100);

fn quote(s: &str) -> std::borrow::Cow<'_, str> {
    shlex::try_quote(s).expect("slot paths never contain embedded NUL bytes")
}

pub struct RemoteHost {
    hostname: String,
    slots: u32,
    socket_path: String,
    configured_slots_dir: Option<String>,
    cached_slots_dir: OnceCell<String>,
    session_factory: Arc<dyn SessionFactory>,
}

impl RemoteHost {
    pub fn new(
        session_factory: Arc<dyn SessionFactory>,
        slots: u32,
        socket_path: impl Into<String>,
        slots_dir: Option<String>,
    ) -> Self {
        let hostname = session_factory.hostname().to_string();
        Self {
            hostname,
            slots,
            socket_path: socket_path.into(),
            configured_slots_dir: slots_dir,
            cached_slots_dir: OnceCell::new(),
            session_factory,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Absolute slots directory, resolved against the remote `$HOME` on
    /// first use and memoised thereafter (spec §3).
    async fn slots_dir(&self) -> Result<String> {
        if let Some(dir) = &self.configured_slots_dir {
            return Ok(dir.clone());
        }
        self.cached_slots_dir
            .get_or_try_init(|| async {
                let mut session = self.session_factory.connect().await?;
                let output = session.run("pwd").await?;
                Ok::<_, RemoteHostError>(format!("{}/{SLOTS_RELATIVE_PATH}", output.stdout.trim_end_matches('/')))
            })
            .await
            .map(|dir| dir.clone())
    }

    fn is_valid_slot_id(&self, slot_id: u32) -> bool {
        if slot_id >= self.slots {
            log::error!(
                "{}: invalid slot id {}, should be in: [0, {})",
                self.hostname,
                slot_id,
                self.slots
            );
            return false;
        }
        true
    }

    async fn slot_lock_path(&self, slot_id: u32) -> Result<String> {
        Ok(format!("{}/slot_{slot_id}.lock", self.slots_dir().await?))
    }

    /// Runs `flock --conflict-exit-code 42 --nonblocking <lockfile> cat` and
    /// confirms the lock was actually acquired. A single attempt; the
    /// caller retries (spec §4.4 steps 1-5).
    async fn try_acquire_lock_channel(
        &self,
        lock_session: &mut dyn ShellSession,
        slot_id: u32,
    ) -> Result<Box<dyn LockChannel>> {
        let lock_path = self.slot_lock_path(slot_id).await?;
        let cmd = format!("flock --conflict-exit-code 42 --nonblocking {} cat", quote(&lock_path));

        log::info!("{}: acquiring lock on slot {}", self.hostname, slot_id);
        let mut channel = lock_session
            .open_lock_channel(&cmd)
            .await
            .map_err(|err| RemoteHostError::LockContended {
                hostname: self.hostname.clone(),
                slot_id,
                reason: err.to_string(),
            })?;

        tokio::time::sleep(LOCK_SPAWN_DELAY).await;

        let contended = |reason: String| RemoteHostError::LockContended {
            hostname: self.hostname.clone(),
            slot_id,
            reason,
        };

        if channel.write_stdin("verify lock\n").await.is_err() {
            let reason = match channel.exit_status().await {
                Some(42) => "slot is locked by others".to_string(),
                _ => "failed to verify lock".to_string(),
            };
            log::debug!("{}: failed to acquire lock on slot {}: {}", self.hostname, slot_id, reason);
            return Err(contended(reason));
        }

        if channel.read_line().await.is_empty() {
            let reason = match channel.exit_status().await {
                Some(42) => "slot is locked by others".to_string(),
                _ => "no output from cat command".to_string(),
            };
            log::debug!("{}: failed to acquire lock on slot {}: {}", self.hostname, slot_id, reason);
            return Err(contended(reason));
        }

        Ok(channel)
    }

    /// Retries [`Self::try_acquire_lock_channel`] with its own dedicated
    /// backoff (spec §4.4: "acquisition is retried up to 3 times ... on
    /// `SlotLockError` alone").
    async fn acquire_lock_channel(&self, lock_session: &mut dyn ShellSession, slot_id: u32) -> Result<Box<dyn LockChannel>> {
        let mut backoff = retry::new_backoff();
        loop {
            match self.try_acquire_lock_channel(lock_session, slot_id).await {
                Ok(channel) => return Ok(channel),
                Err(err) => match backoff.next_backoff() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(err),
                },
            }
        }
    }

    /// Opens both sessions, holds the advisory lock for the duration of
    /// `body`, and releases it on every exit path (spec §4.4).
    async fn open_two_sessions(&self, slot_id: u32) -> Result<(Box<dyn ShellSession>, Box<dyn LockChannel>)> {
        let opening_failed = |err: RemoteHostError| RemoteHostError::LockContended {
            hostname: self.hostname.clone(),
            slot_id,
            reason: format!("failed to open SSH sessions: {err}"),
        };

        let slot_session = self.session_factory.connect().await.map_err(opening_failed)?;
        let mut lock_session = self.session_factory.connect().await.map_err(opening_failed)?;

        let lock_channel = self.acquire_lock_channel(lock_session.as_mut(), slot_id).await?;
        Ok((slot_session, lock_channel))
    }

    pub async fn is_operational(&self) -> bool {
        let slots_dir = match self.slots_dir().await {
            Ok(dir) => dir,
            Err(err) => {
                log::error!("{}: host is not operational: {}", self.hostname, err);
                return false;
            }
        };
        let mut session = match self.session_factory.connect().await {
            Ok(session) => session,
            Err(err) => {
                log::error!("{}: host is not operational: {}", self.hostname, err);
                return false;
            }
        };
        match session.run(&format!("mkdir -p {}", quote(&slots_dir))).await {
            Ok(output) if output.exit_code == 0 => true,
            Ok(output) => {
                log::error!("{}: cannot prepare slots directory:\n{}", self.hostname, output.stderr);
                false
            }
            Err(err) => {
                log::error!("{}: host is not operational: {}", self.hostname, err);
                false
            }
        }
    }

    /// Best-effort RPM inventory probe. Informational only; never on the
    /// locking critical path (spec §4.4).
    pub async fn rpms_installed(&self) -> Option<String> {
        let mut session = match self.session_factory.connect().await {
            Ok(session) => session,
            Err(err) => {
                log::info!("can't get rpms from host: {}: {}", self.hostname, err);
                return None;
            }
        };
        match session.run("rpm -qa").await {
            Ok(output) => Some(output.stdout),
            Err(err) => {
                log::info!("can't get rpms from host: {}: {}", self.hostname, err);
                None
            }
        }
    }

    pub async fn prid_in_slot(&self, slot_id: u32) -> Result<Option<String>> {
        if !self.is_valid_slot_id(slot_id) {
            return Ok(None);
        }
        let slots_dir = self.slots_dir().await?;
        let mut session = self.session_factory.connect().await?;
        let mut slot = HostSlot::new(session.as_mut(), self.hostname.clone(), slot_id, &slots_dir);
        slot.prid().await
    }

    /// Locks `slot_id` for `prid`. Retried up to 3x on lock contention or
    /// slot I/O failure (spec §4.4).
    pub async fn lock(&self, slot_id: u32, prid: &str) -> bool {
        if !self.is_valid_slot_id(slot_id) {
            return false;
        }

        let mut backoff = retry::new_backoff();
        let locked = loop {
            match self.try_lock_once(slot_id, prid).await {
                Ok(locked) => break locked,
                Err(err) => match backoff.next_backoff() {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        log::warn!(
                            "{}: failed to lock slot {} for pipelinerun {}: {}",
                            self.hostname,
                            slot_id,
                            prid,
                            err
                        );
                        break false;
                    }
                },
            }
        };

        if locked {
            log::info!("{}: slot {} is locked for pipelinerun {}", self.hostname, slot_id, prid);
        } else {
            log::warn!("{}: failed to lock slot {} for pipelinerun {}", self.hostname, slot_id, prid);
        }
        locked
    }

    async fn try_lock_once(&self, slot_id: u32, prid: &str) -> Result<bool> {
        let slots_dir = self.slots_dir().await?;
        let (mut slot_session, mut lock_channel) = self.open_two_sessions(slot_id).await?;
        let mut slot = HostSlot::new(slot_session.as_mut(), self.hostname.clone(), slot_id, &slots_dir);
        let result = slot.lock(prid).await;
        lock_channel.close_stdin().await;
        result
    }

    /// Unlocks `slot_id` for `prid`. Retried up to 3x on lock contention or
    /// slot I/O failure (spec §4.4).
    pub async fn unlock(&self, slot_id: u32, prid: &str) -> bool {
        if !self.is_valid_slot_id(slot_id) {
            return false;
        }

        let mut backoff = retry::new_backoff();
        let unlocked = loop {
            match self.try_unlock_once(slot_id, prid).await {
                Ok(unlocked) => break unlocked,
                Err(err) => match backoff.next_backoff() {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        log::warn!(
                            "{}: failed to unlock slot {} for pipelinerun {}: {}",
                            self.hostname,
                            slot_id,
                            prid,
                            err
                        );
                        break false;
                    }
                },
            }
        };

        if unlocked {
            log::info!("{}: slot {} is unlocked for pipelinerun {}", self.hostname, slot_id, prid);
        } else {
            log::warn!("{}: failed to unlock slot {} for pipelinerun {}", self.hostname, slot_id, prid);
        }
        unlocked
    }

    async fn try_unlock_once(&self, slot_id: u32, prid: &str) -> Result<bool> {
        let slots_dir = self.slots_dir().await?;
        let (mut slot_session, mut lock_channel) = self.open_two_sessions(slot_id).await?;
        let mut slot = HostSlot::new(slot_session.as_mut(), self.hostname.clone(), slot_id, &slots_dir);
        let result = slot.unlock(prid).await;
        lock_channel.close_stdin().await;
        result
    }

    /// Point-in-time best estimate: not a reservation, no locking taken.
    /// A slot is "available" if empty or corrupted (spec §4.4).
    pub async fn available_slots(&self) -> Result<Vec<u32>> {
        log::debug!("{}: retrieve list of available slots", self.hostname);
        let slots_dir = self.slots_dir().await?;
        let mut session = self.session_factory.connect().await?;
        let mut available = Vec::new();
        for slot_id in 0..self.slots {
            let mut slot = HostSlot::new(session.as_mut(), self.hostname.clone(), slot_id, &slots_dir);
            // Short-circuits: `is_valid` is only read when the slot isn't
            // already free, avoiding a second round trip in the common case.
            if slot.is_free().await? || !slot.is_valid().await? {
                available.push(slot_id);
            } else {
                log::debug!("{}: slot {} is not free", self.hostname, slot_id);
            }
        }
        Ok(available)
    }

    pub async fn occupied_slots(&self) -> Result<Vec<u32>> {
        log::debug!("{}: retrieve list of occupied slots", self.hostname);
        let available: std::collections::HashSet<u32> = self.available_slots().await?.into_iter().collect();
        Ok((0..self.slots).filter(|id| !available.contains(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::{FakeRemote, FakeSessionFactory};

    fn host(remote: FakeRemote, slots: u32) -> RemoteHost {
        let factory = Arc::new(FakeSessionFactory::new("remote-host-001", remote));
        RemoteHost::new(factory, slots, "/run/podman/podman.sock", Some("/home/builder/osbs_slots".to_string()))
    }

    #[tokio::test]
    async fn lock_then_unlock_round_trips() {
        let remote = FakeRemote::new();
        let h = host(remote.clone(), 3);
        assert!(h.lock(1, "pr1").await);
        assert_eq!(h.prid_in_slot(1).await.unwrap().as_deref(), Some("pr1"));
        assert!(h.unlock(1, "pr1").await);
        assert_eq!(h.prid_in_slot(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_on_already_occupied_slot_fails() {
        let remote = FakeRemote::new();
        remote.set_file("/home/builder/osbs_slots/slot_0", "pr1@2022-02-15T10:12:13.780426");
        let h = host(remote.clone(), 3);
        assert!(!h.lock(0, "pr2").await);
    }

    #[tokio::test]
    async fn invalid_slot_id_is_rejected_without_touching_the_host() {
        let remote = FakeRemote::new();
        let h = host(remote.clone(), 2);
        assert!(!h.lock(5, "pr1").await);
        assert!(!h.unlock(5, "pr1").await);
    }

    #[tokio::test]
    async fn available_and_occupied_slots_partition_the_range() {
        let remote = FakeRemote::new();
        remote.set_file("/home/builder/osbs_slots/slot_1", "pr1@2022-02-15T10:12:13.780426");
        let h = host(remote.clone(), 3);
        let available = h.available_slots().await.unwrap();
        let occupied = h.occupied_slots().await.unwrap();
        assert_eq!(available, vec![0, 2]);
        assert_eq!(occupied, vec![1]);
    }

    #[tokio::test]
    async fn is_operational_prepares_the_slots_directory() {
        let remote = FakeRemote::new();
        let h = host(remote.clone(), 1);
        assert!(h.is_operational().await);
    }

    /// E3: a second session that finds the lockfile already held by another
    /// process gets `flock`'s exit code 42, surfaced as `LockContended` with
    /// reason "slot is locked by others".
    #[tokio::test]
    async fn contended_lock_reports_locked_by_others() {
        let remote = FakeRemote::new();
        let h = host(remote.clone(), 1);
        let factory = FakeSessionFactory::new("remote-host-001", remote.clone());

        let mut holder = factory.connect().await.unwrap();
        let lock_path = h.slot_lock_path(0).await.unwrap();
        let cmd = format!("flock --conflict-exit-code 42 --nonblocking {} cat", quote(&lock_path));
        let mut holder_channel = holder.open_lock_channel(&cmd).await.unwrap();

        let mut contender = factory.connect().await.unwrap();
        let err = h.try_acquire_lock_channel(contender.as_mut(), 0).await.unwrap_err();
        match err {
            RemoteHostError::LockContended { reason, .. } => assert_eq!(reason, "slot is locked by others"),
            other => panic!("expected LockContended, got {other:?}"),
        }

        holder_channel.close_stdin().await;
    }
}
