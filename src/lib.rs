//! Distributed slot-lease coordinator for a fleet of remote build hosts.
//!
//! Mutual exclusion is enforced on the remote host itself, via SSH and
//! `flock(1)` — there is no central broker and no daemon beyond `sshd`.
//! [`pool::RemoteHostsPool`] picks a host and slot for a pipeline run;
//! [`remote_host::RemoteHost`] owns the two-session advisory lock protocol
//! against one host; [`host_slot::HostSlot`] and [`slot_data::SlotData`]
//! implement the on-host payload format that protocol guards.

pub mod config;
pub mod error;
pub mod host_slot;
pub mod logging;
pub mod pool;
pub mod remote_host;
pub mod retry;
pub mod slot_data;
pub mod ssh;

pub use config::{HostConfig, RemoteHostsConfig};
pub use error::{RemoteHostError, Result};
pub use pool::{Lease, RemoteHostsPool};
pub use remote_host::RemoteHost;
pub use slot_data::SlotData;
