//! Server-side sessions with renewable expiry.
//!
//! A [`SessionStore`] binds keys to [`Session`]s. Each session owns a
//! [`TimedPermit`] from the store's [`TimedPermitIssuer`]; locating the session
//! renews the permit, and a permit left alone past its lifetime expires the session.

pub mod permit;
pub mod store;

#[cfg(test)]
mod tests;

pub use permit::{PermitListener, PermitState, TimedPermit, TimedPermitIssuer};
pub use store::{Session, SessionConfig, SessionListener, SessionStore};
