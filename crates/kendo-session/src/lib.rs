//! Session credential management for the Kendo backend.
//!
//! A login yields a short-lived token with an absolute expiry. The
//! [`RenewalScheduler`] renews it a fixed margin before it expires, persists
//! each renewed credential through a [`CredentialStore`] and keeps doing so
//! until a renewal fails or the session is logged out. [`SessionController`]
//! is the entry point most callers want.
//!
//! ```no_run
//! use kendo_session::{CredentialStore, SessionConfig, SessionController};
//!
//! # async fn run() -> kendo_session::Result<()> {
//! let config = SessionConfig::from_env()?;
//! let session = SessionController::http(&config, CredentialStore::in_memory())?;
//! session.login("admin", "admin").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod events;
pub mod http;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

pub use client::{
    AuthenticatedUser, Authenticator, HttpAuthClient, LoginOutcome, RenewalClient,
    credential_from_headers,
};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{ProxyConfig, SessionConfig};
pub use controller::{SessionController, SessionStatus};
pub use credential::{Credential, DEFAULT_RENEWAL_MARGIN, renewal_delay};
pub use error::{AuthError, Error, RenewalError, RenewalFailureKind, Result, StoreError};
pub use events::{SessionEvent, SessionEventBroadcaster};
pub use scheduler::{
    RenewalObserver, RenewalScheduler, RenewalSchedulerBuilder, ScheduleOutcome, SchedulerState,
};
pub use store::{CredentialStore, FileStore, KeyValueStore, MemoryStore};
