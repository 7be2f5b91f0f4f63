//! Cloud session management.
//!
//! - [`TokenManager`]: owns one bearer credential, refreshes it through a
//!   rate-limited re-authentication and optionally on a background cadence.
//! - [`RegionalAuthenticator`]: one token manager per geographic region, with
//!   relay hostname to region mapping.
//! - [`Authenticator`] / [`HttpAuthenticator`]: the outbound authentication call.
//! - [`TokenSource`]: what push-channel owners need from either of the above.

pub mod authenticator;
pub mod error;
pub mod region;
pub mod token;

pub use authenticator::{Authenticator, HttpAuthenticator};
pub use error::AuthError;
pub use region::RegionalAuthenticator;
pub use token::{Credential, TokenManager, TokenSource, TokenTiming};
