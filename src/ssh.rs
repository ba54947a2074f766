//! SSH transport: [`ShellSession`]/[`LockChannel`] are the seam the rest of
//! the crate programs against, so the lock protocol and slot I/O can be
//! exercised against an in-memory fake without a real network (spec §8).
//! [`RetryingSession`] is the production implementation, backed by `russh`.
//!
//! Connect and command execution retry on transient network errors only
//! (connection refused, dropped session); authentication failures and
//! non-zero exit statuses are not retried (spec §4.2).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;

use crate::error::{RemoteHostError, Result};
use crate::retry;

pub const SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a completed remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }
}

/// A long-running remote command whose stdin is kept open by the caller —
/// used only for the `flock ... cat` lock-holding process (spec §4.4).
#[async_trait]
pub trait LockChannel: Send {
    async fn write_stdin(&mut self, line: &str) -> std::io::Result<()>;
    /// Reads one line of stdout, or `""` if none is available (EOF or the
    /// remote process never produced output).
    async fn read_line(&mut self) -> String;
    /// The channel's exit status, once the remote process has exited.
    async fn exit_status(&mut self) -> Option<i32>;
    /// Closes stdin. For `flock ... cat` this makes `cat` see EOF, exit,
    /// and release the `flock`.
    async fn close_stdin(&mut self);
}

/// One SSH connection, able to run one-shot commands and open
/// lock-holding channels.
#[async_trait]
pub trait ShellSession: Send {
    async fn run(&mut self, cmd: &str) -> Result<CommandOutput>;
    async fn open_lock_channel(&mut self, cmd: &str) -> Result<Box<dyn LockChannel>>;
}

/// Opens fresh [`ShellSession`]s against one remote host. A new session is
/// a new SSH connection — two independent sessions are required per lock
/// acquisition (spec §4.4).
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ShellSession>>;
    fn hostname(&self) -> &str;
}

// ===========================================================================
// Production implementation: russh
// ===========================================================================

struct PermissiveHandler;

impl russh::client::Handler for PermissiveHandler {
    type Error = russh::Error;

    /// Host-key verification always accepts: this talks to cooperating
    /// build-fleet infrastructure, not a hostile endpoint (spec §4.2).
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connection parameters for one remote host.
pub struct RetryingSessionFactory {
    hostname: String,
    port: u16,
    username: String,
    ssh_keyfile: PathBuf,
}

impl RetryingSessionFactory {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, ssh_keyfile: impl AsRef<Path>) -> Self {
        Self {
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            ssh_keyfile: ssh_keyfile.as_ref().to_path_buf(),
        }
    }

    async fn connect_once(&self) -> std::result::Result<russh::client::Handle<PermissiveHandler>, anyhow::Error> {
        let config = Arc::new(russh::client::Config::default());
        let mut session =
            russh::client::connect(config, (self.hostname.as_str(), self.port), PermissiveHandler).await?;

        let key_pair = russh::keys::load_secret_key(&self.ssh_keyfile, None)?;
        let auth = session
            .authenticate_publickey(
                &self.username,
                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), None),
            )
            .await?;
        anyhow::ensure!(
            auth.success(),
            "SSH public-key authentication rejected for {}@{}",
            self.username,
            self.hostname
        );
        Ok(session)
    }
}

#[async_trait]
impl SessionFactory for RetryingSessionFactory {
    async fn connect(&self) -> Result<Box<dyn ShellSession>> {
        let mut backoff = retry::new_backoff();
        loop {
            match self.connect_once().await {
                Ok(handle) => {
                    return Ok(Box::new(RetryingSession {
                        hostname: self.hostname.clone(),
                        handle,
                    }))
                }
                Err(err) if is_recoverable(&err) => match backoff.next_backoff() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(RemoteHostError::HostUnreachable {
                            hostname: self.hostname.clone(),
                            source: err,
                        })
                    }
                },
                Err(err) => {
                    return Err(RemoteHostError::HostUnreachable {
                        hostname: self.hostname.clone(),
                        source: err,
                    })
                }
            }
        }
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Only connection-level drops/resets are treated as retriable; auth
/// failures and anything else are permanent (spec §4.2).
fn is_recoverable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<russh::Error>() {
        Some(russh::Error::Disconnect | russh::Error::SendError | russh::Error::IO(_)) => true,
        Some(_) => false,
        None => false,
    }
}

pub struct RetryingSession {
    hostname: String,
    handle: russh::client::Handle<PermissiveHandler>,
}

impl RetryingSession {
    async fn exec_once(&mut self, cmd: &str) -> std::result::Result<CommandOutput, russh::Error> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, cmd).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: Option<u32> = None;

        let collect = async {
            loop {
                match channel.wait().await {
                    Some(russh::ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(russh::ChannelMsg::ExtendedData { data, .. }) => stderr.extend_from_slice(&data),
                    Some(russh::ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                    Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) => {}
                    Some(_) => {}
                    None => break,
                }
            }
        };
        if tokio::time::timeout(SSH_COMMAND_TIMEOUT, collect).await.is_err() {
            return Err(russh::Error::IO(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("command timed out after {SSH_COMMAND_TIMEOUT:?}"),
            )));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            exit_code: exit_code.unwrap_or(u32::MAX) as i32,
        })
    }
}

#[async_trait]
impl ShellSession for RetryingSession {
    async fn run(&mut self, cmd: &str) -> Result<CommandOutput> {
        let mut backoff = retry::new_backoff();
        loop {
            match self.exec_once(cmd).await {
                Ok(output) => return Ok(output),
                Err(err) if matches!(err, russh::Error::Disconnect | russh::Error::SendError | russh::Error::IO(_)) => {
                    match backoff.next_backoff() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            return Err(RemoteHostError::HostUnreachable {
                                hostname: self.hostname.clone(),
                                source: err.into(),
                            })
                        }
                    }
                }
                Err(err) => {
                    return Err(RemoteHostError::HostUnreachable {
                        hostname: self.hostname.clone(),
                        source: err.into(),
                    })
                }
            }
        }
    }

    async fn open_lock_channel(&mut self, cmd: &str) -> Result<Box<dyn LockChannel>> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| RemoteHostError::HostUnreachable {
                hostname: self.hostname.clone(),
                source: e.into(),
            })?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| RemoteHostError::HostUnreachable {
                hostname: self.hostname.clone(),
                source: e.into(),
            })?;
        Ok(Box::new(RusshLockChannel {
            channel,
            exit_status: None,
        }))
    }
}

struct RusshLockChannel {
    channel: russh::Channel<russh::client::Msg>,
    exit_status: Option<i32>,
}

#[async_trait]
impl LockChannel for RusshLockChannel {
    async fn write_stdin(&mut self, line: &str) -> std::io::Result<()> {
        self.channel
            .data(line.as_bytes())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
    }

    async fn read_line(&mut self) -> String {
        loop {
            match self.channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => {
                    return String::from_utf8_lossy(&data).lines().next().unwrap_or("").to_string();
                }
                Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                    self.exit_status = Some(exit_status as i32);
                }
                Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) => return String::new(),
                Some(_) => continue,
                None => return String::new(),
            }
        }
    }

    async fn exit_status(&mut self) -> Option<i32> {
        if self.exit_status.is_some() {
            return self.exit_status;
        }
        while let Some(msg) = self.channel.wait().await {
            if let russh::ChannelMsg::ExitStatus { exit_status } = msg {
                self.exit_status = Some(exit_status as i32);
                break;
            }
        }
        self.exit_status
    }

    async fn close_stdin(&mut self) {
        let _ = self.channel.eof().await;
    }
}

// ===========================================================================
// Test double: an in-memory fake remote filesystem
// ===========================================================================

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeRemoteState {
        files: HashMap<String, String>,
        held_locks: HashSet<String>,
    }

    /// A shared in-memory remote filesystem. Clone cheaply to simulate
    /// multiple independent SSH sessions against the same host.
    #[derive(Clone, Default)]
    pub struct FakeRemote(Arc<Mutex<FakeRemoteState>>);

    impl FakeRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_file(&self, path: &str, content: &str) {
            self.0.lock().unwrap().files.insert(path.to_string(), content.to_string());
        }

        pub fn file(&self, path: &str) -> String {
            self.0.lock().unwrap().files.get(path).cloned().unwrap_or_default()
        }
    }

    fn unquote(token: &str) -> String {
        shlex::split(token.trim())
            .and_then(|mut parts| parts.pop())
            .unwrap_or_else(|| token.trim().to_string())
    }

    pub struct FakeSession {
        remote: FakeRemote,
    }

    impl FakeSession {
        pub fn new(remote: FakeRemote) -> Self {
            Self { remote }
        }
    }

    #[async_trait]
    impl ShellSession for FakeSession {
        async fn run(&mut self, cmd: &str) -> Result<CommandOutput> {
            let mut state = self.remote.0.lock().unwrap();

            if cmd.starts_with("mkdir -p ") {
                return Ok(CommandOutput::ok(""));
            }
            if cmd.starts_with("rpm ") {
                return Ok(CommandOutput::ok("fake-package-1.0-1.noarch"));
            }
            if let Some(rest) = cmd.strip_prefix("touch ") {
                if let Some((touch_part, cat_part)) = rest.split_once(" && cat ") {
                    let path = unquote(touch_part);
                    debug_assert_eq!(path, unquote(cat_part));
                    let content = state.files.entry(path).or_default().clone();
                    return Ok(CommandOutput::ok(content));
                }
            }
            if let Some(rest) = cmd.strip_prefix("truncate -s 0 ") {
                let path = unquote(rest);
                state.files.insert(path, String::new());
                return Ok(CommandOutput::ok(""));
            }
            if let Some(rest) = cmd.strip_prefix("echo ") {
                if let Some((data_part, path_part)) = rest.rsplit_once(" > ") {
                    let data = unquote(data_part);
                    let path = unquote(path_part);
                    state.files.insert(path, data);
                    return Ok(CommandOutput::ok(""));
                }
            }
            panic!("FakeSession: unexpected command: {cmd}");
        }

        async fn open_lock_channel(&mut self, cmd: &str) -> Result<Box<dyn LockChannel>> {
            // cmd: "flock --conflict-exit-code 42 --nonblocking <path> cat"
            let lock_path = cmd
                .strip_prefix("flock --conflict-exit-code 42 --nonblocking ")
                .and_then(|rest| rest.strip_suffix(" cat"))
                .map(unquote)
                .expect("unexpected flock invocation");

            let acquired = self.remote.0.lock().unwrap().held_locks.insert(lock_path.clone());
            Ok(Box::new(FakeLockChannel {
                remote: self.remote.clone(),
                lock_path,
                acquired,
                pending_echo: None,
                closed: false,
            }))
        }
    }

    struct FakeLockChannel {
        remote: FakeRemote,
        lock_path: String,
        acquired: bool,
        pending_echo: Option<String>,
        closed: bool,
    }

    #[async_trait]
    impl LockChannel for FakeLockChannel {
        async fn write_stdin(&mut self, line: &str) -> std::io::Result<()> {
            if !self.acquired || self.closed {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "flock did not acquire the lock"));
            }
            self.pending_echo = Some(line.to_string());
            Ok(())
        }

        async fn read_line(&mut self) -> String {
            if !self.acquired {
                return String::new();
            }
            self.pending_echo.take().unwrap_or_default()
        }

        async fn exit_status(&mut self) -> Option<i32> {
            if self.acquired {
                None
            } else {
                Some(42)
            }
        }

        async fn close_stdin(&mut self) {
            if self.acquired && !self.closed {
                self.remote.0.lock().unwrap().held_locks.remove(&self.lock_path);
            }
            self.closed = true;
        }
    }

    pub struct FakeSessionFactory {
        hostname: String,
        remote: FakeRemote,
    }

    impl FakeSessionFactory {
        pub fn new(hostname: impl Into<String>, remote: FakeRemote) -> Self {
            Self {
                hostname: hostname.into(),
                remote,
            }
        }
    }

    #[async_trait]
    impl SessionFactory for FakeSessionFactory {
        async fn connect(&self) -> Result<Box<dyn ShellSession>> {
            Ok(Box::new(FakeSession::new(self.remote.clone())))
        }

        fn hostname(&self) -> &str {
            &self.hostname
        }
    }

    /// A [`SessionFactory`] that succeeds its first `succeed_for` connects
    /// and fails every one after that, simulating a host that goes
    /// unreachable partway through a scheduling decision (e.g. `mkdir -p`
    /// succeeds but the next connect for `available_slots` drops).
    pub struct FlakySessionFactory {
        hostname: String,
        remote: FakeRemote,
        succeed_for: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FlakySessionFactory {
        pub fn new(hostname: impl Into<String>, remote: FakeRemote, succeed_for: usize) -> Self {
            Self {
                hostname: hostname.into(),
                remote,
                succeed_for,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for FlakySessionFactory {
        async fn connect(&self) -> Result<Box<dyn ShellSession>> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call < self.succeed_for {
                Ok(Box::new(FakeSession::new(self.remote.clone())))
            } else {
                Err(RemoteHostError::HostUnreachable {
                    hostname: self.hostname.clone(),
                    source: anyhow::anyhow!("simulated connection failure"),
                })
            }
        }

        fn hostname(&self) -> &str {
            &self.hostname
        }
    }

    /// A [`SessionFactory`] whose every connect fails outright, for hosts
    /// that should never become operational.
    pub struct AlwaysFailingSessionFactory {
        hostname: String,
    }

    impl AlwaysFailingSessionFactory {
        pub fn new(hostname: impl Into<String>) -> Self {
            Self { hostname: hostname.into() }
        }
    }

    #[async_trait]
    impl SessionFactory for AlwaysFailingSessionFactory {
        async fn connect(&self) -> Result<Box<dyn ShellSession>> {
            Err(RemoteHostError::HostUnreachable {
                hostname: self.hostname.clone(),
                source: anyhow::anyhow!("simulated connection failure"),
            })
        }

        fn hostname(&self) -> &str {
            &self.hostname
        }
    }
}
