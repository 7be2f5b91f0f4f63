//! `fleetlink` Daemon Library
//!
//! Fleet connectivity and command dispatch for cloud-registered devices:
//! - Cloud session management with single and multi-region token refresh
//! - Persistent push channels to relay hosts
//! - Fleet orchestration: command routing, batches, groups, status cache
//! - Bulk provisioning tasks built on the fleet command path
//! - Grant/revoke webhook intake feeding the device index

pub mod channel;
pub mod daemon;
pub mod fleet;
pub mod intake;
pub mod provision;
pub mod session;
