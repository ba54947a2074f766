//! A single slot file, bound to one already-open SSH session. Created per
//! operation, never shared across tasks (spec §3).

use crate::error::{RemoteHostError, Result};
use crate::slot_data::{now_utc_iso8601, SlotData};
use crate::ssh::ShellSession;

fn quote(s: &str) -> std::borrow::Cow<'_, str> {
    shlex::try_quote(s).expect("slot paths and payloads never contain embedded NUL bytes")
}

pub struct HostSlot<'a> {
    session: &'a mut dyn ShellSession,
    hostname: String,
    slot_id: u32,
    path: String,
}

impl<'a> HostSlot<'a> {
    pub fn new(session: &'a mut dyn ShellSession, hostname: impl Into<String>, slot_id: u32, slots_dir: &str) -> Self {
        let path = format!("{}/slot_{}", slots_dir.trim_end_matches('/'), slot_id);
        Self {
            session,
            hostname: hostname.into(),
            slot_id,
            path,
        }
    }

    /// Reads the raw payload, creating the file first if it doesn't exist.
    async fn read(&mut self) -> Result<SlotData> {
        let path = quote(&self.path);
        let cmd = format!("touch {path} && cat {path}");
        let output = self.session.run(&cmd).await?;
        if output.exit_code != 0 {
            return Err(RemoteHostError::ReadError {
                hostname: self.hostname.clone(),
                slot_id: self.slot_id,
                reason: output.stderr,
            });
        }
        Ok(SlotData::parse(&output.stdout))
    }

    /// Writes `data`, or empties the file when `data` is `None`/empty.
    async fn write(&mut self, data: Option<&str>) -> Result<()> {
        let path = quote(&self.path);
        let cmd = match data {
            Some(data) if !data.is_empty() => format!("echo {} > {path}", quote(data)),
            _ => format!("truncate -s 0 {path}"),
        };
        let output = self.session.run(&cmd).await?;
        if output.exit_code != 0 {
            return Err(RemoteHostError::WriteError {
                hostname: self.hostname.clone(),
                slot_id: self.slot_id,
                reason: output.stderr,
            });
        }
        Ok(())
    }

    pub async fn is_free(&mut self) -> Result<bool> {
        Ok(self.read().await?.is_empty())
    }

    pub async fn is_valid(&mut self) -> Result<bool> {
        Ok(self.read().await?.is_valid())
    }

    pub async fn prid(&mut self) -> Result<Option<String>> {
        Ok(self.read().await?.prid)
    }

    /// Locks the slot for `prid`. Refuses only when the current content is
    /// valid and occupied; corrupted content is silently reclaimed
    /// (spec §4.3, §8 items 4-5).
    pub async fn lock(&mut self, prid: &str) -> Result<bool> {
        let current = self.read().await?;
        let free = current.is_empty();
        let valid = current.is_valid();

        if !free && valid {
            log::debug!("{}: slot {} is not free, unable to lock it", self.hostname, self.slot_id);
            return Ok(false);
        }
        if !valid {
            log::warn!(
                "{}: slot {} contains invalid content, it's corrupted, will use it.",
                self.hostname,
                self.slot_id
            );
        }

        let data = SlotData::new(prid, now_utc_iso8601());
        self.write(Some(&data.serialize())).await?;
        Ok(true)
    }

    /// Unlocks the slot. Idempotent on an already-free slot (spec §9 open
    /// question, codified as returning `true`); refuses only when occupied
    /// by a different `prid` (spec §4.3, §8 item 6).
    pub async fn unlock(&mut self, prid: &str) -> Result<bool> {
        let current = self.read().await?;

        if current.is_empty() {
            log::warn!("{}: slot {} is free, skip unlocking", self.hostname, self.slot_id);
            return Ok(true);
        }
        if !current.is_valid() {
            log::warn!(
                "{}: slot {} contains invalid content, it's corrupted, will unlock it.",
                self.hostname,
                self.slot_id
            );
            self.write(None).await?;
            return Ok(true);
        }
        if current.prid.as_deref() != Some(prid) {
            log::warn!(
                "{}: cannot unlock slot {}, it's not locked by {}",
                self.hostname,
                self.slot_id,
                prid
            );
            return Ok(false);
        }

        self.write(None).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::{FakeRemote, FakeSession};

    async fn slot(remote: &FakeRemote, session: &mut FakeSession, id: u32) -> HostSlot<'_> {
        let _ = remote;
        HostSlot::new(session, "remote-host-001", id, "/home/builder/osbs_slots")
    }

    #[tokio::test]
    async fn locking_a_free_slot_succeeds() {
        let remote = FakeRemote::new();
        let mut session = FakeSession::new(remote.clone());
        let mut s = slot(&remote, &mut session, 2).await;
        assert!(s.lock("pr123").await.unwrap());
        let stored = remote.file("/home/builder/osbs_slots/slot_2");
        assert!(stored.starts_with("pr123@"));
    }

    #[tokio::test]
    async fn locking_an_occupied_slot_fails_and_leaves_it_unchanged() {
        let remote = FakeRemote::new();
        remote.set_file(
            "/home/builder/osbs_slots/slot_2",
            "123@2022-02-15T10:12:13.780426",
        );
        let mut session = FakeSession::new(remote.clone());
        let mut s = slot(&remote, &mut session, 2).await;
        assert!(!s.lock("pr234").await.unwrap());
        assert_eq!(remote.file("/home/builder/osbs_slots/slot_2"), "123@2022-02-15T10:12:13.780426");
    }

    #[tokio::test]
    async fn locking_corrupted_content_reclaims_it() {
        let remote = FakeRemote::new();
        remote.set_file("/home/builder/osbs_slots/slot_2", "invalid_slot_content");
        let mut session = FakeSession::new(remote.clone());
        let mut s = slot(&remote, &mut session, 2).await;
        assert!(s.lock("pr123").await.unwrap());
        assert!(remote.file("/home/builder/osbs_slots/slot_2").starts_with("pr123@"));
    }

    #[tokio::test]
    async fn unlock_by_wrong_owner_is_refused() {
        let remote = FakeRemote::new();
        remote.set_file(
            "/home/builder/osbs_slots/slot_2",
            "pr124@2022-02-15T10:22:33.234234",
        );
        let mut session = FakeSession::new(remote.clone());
        let mut s = slot(&remote, &mut session, 2).await;
        assert!(!s.unlock("pr123").await.unwrap());
        assert_eq!(
            remote.file("/home/builder/osbs_slots/slot_2"),
            "pr124@2022-02-15T10:22:33.234234"
        );
    }

    #[tokio::test]
    async fn unlock_of_free_slot_is_idempotent() {
        let remote = FakeRemote::new();
        let mut session = FakeSession::new(remote.clone());
        let mut s = slot(&remote, &mut session, 2).await;
        assert!(s.unlock("pr123").await.unwrap());
    }

    #[tokio::test]
    async fn unlock_by_owner_clears_the_slot() {
        let remote = FakeRemote::new();
        remote.set_file(
            "/home/builder/osbs_slots/slot_2",
            "pr123@2022-02-15T10:22:33.234234",
        );
        let mut session = FakeSession::new(remote.clone());
        let mut s = slot(&remote, &mut session, 2).await;
        assert!(s.unlock("pr123").await.unwrap());
        assert_eq!(remote.file("/home/builder/osbs_slots/slot_2"), "");
    }
}
