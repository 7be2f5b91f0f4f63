//! `fleetlink` Core Library
//!
//! Shared functionality for `fleetlink` components:
//! - Device/account index backing every authorization decision
//! - Access-group parsing
//! - Per-device health bookkeeping
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod access;
pub mod config;
pub mod consent;
pub mod error;
pub mod health;
pub mod index;
pub mod tracing_init;

pub use access::can_control;
pub use config::Config;
pub use error::{Error, Result};
pub use health::{DeviceHealth, HealthMonitor, HealthSummary};
pub use index::{Account, AccountDevice, DeviceCallback, DeviceIndex, IndexError};
