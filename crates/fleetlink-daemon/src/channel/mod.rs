//! Persistent push channels to relay hosts.
//!
//! - [`PushChannel`]: one streaming connection with typed event dispatch,
//!   keepalive and idempotent close.
//! - [`ChannelEvent`]: decoded inbound events.
//! - [`ChannelOptions`] / [`ReconnectPolicy`]: dialing and caller-side
//!   reconnect schedule.

pub mod actions;
pub mod client;
pub mod config;
pub mod error;
pub mod event;

pub use actions::CoverMotion;
pub use client::{ChannelHandlers, PushChannel};
pub use config::{ChannelOptions, ReconnectPolicy};
pub use error::ChannelError;
pub use event::ChannelEvent;
