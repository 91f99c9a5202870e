//! Session controller.
//!
//! Ties login, persistence and the renewal scheduler together.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::client::{Authenticator, HttpAuthClient, LoginOutcome};
use crate::config::SessionConfig;
use crate::credential::Credential;
use crate::error::{AuthError, RenewalFailureKind, Result};
use crate::events::SessionEvent;
use crate::scheduler::{RenewalScheduler, ScheduleOutcome, SchedulerState};
use crate::store::CredentialStore;

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub credential: Option<Credential>,
    pub state: SchedulerState,
    pub last_failure: Option<RenewalFailureKind>,
}

/// Facade over login, logout and automatic renewal.
#[derive(Clone)]
pub struct SessionController {
    authenticator: Arc<dyn Authenticator>,
    scheduler: RenewalScheduler,
}

impl SessionController {
    /// Build a controller from an authenticator and a configured scheduler.
    ///
    /// The scheduler's store is the one credentials are persisted to.
    pub fn new(authenticator: Arc<dyn Authenticator>, scheduler: RenewalScheduler) -> Self {
        Self {
            authenticator,
            scheduler,
        }
    }

    /// Controller talking to the HTTP backend described by `config`.
    pub fn http(config: &SessionConfig, store: CredentialStore) -> Result<Self> {
        let client = Arc::new(HttpAuthClient::new(config)?);
        let scheduler = RenewalScheduler::builder(client.clone(), store)
            .margin(config.renewal_margin)
            .build();
        Ok(Self::new(client, scheduler))
    }

    /// Authenticate, persist the issued credential and start renewing it.
    ///
    /// On failure the previous session, if any, keeps its stored credential
    /// and its renewal cycle.
    #[instrument(skip(self, password))]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<LoginOutcome, AuthError> {
        let outcome = self.authenticator.login(username, password).await?;

        // Stop the previous cycle before its credential is replaced.
        let was_active = !self.scheduler.state().await.is_idle();
        self.scheduler.cancel().await;
        if let Err(error) = self.store().set(&outcome.credential).await {
            if was_active {
                self.restore_previous_cycle().await;
            }
            return Err(error.into());
        }
        self.scheduler.reset_failure().await;

        info!(
            user = %outcome.user.username,
            expires_at = outcome.credential.expires_at,
            "Logged in"
        );
        self.scheduler.events().publish(SessionEvent::LoggedIn {
            username: username.to_string(),
            expires_at: outcome.credential.expires_at,
        });

        self.scheduler.schedule(outcome.credential.clone()).await;
        Ok(outcome)
    }

    /// Re-arm renewal of whatever credential is still stored.
    async fn restore_previous_cycle(&self) {
        match self.store().get().await {
            Ok(Some(previous)) => {
                warn!(
                    expires_at = previous.expires_at,
                    "Could not persist new login; keeping previous session"
                );
                self.scheduler.schedule(previous).await;
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "Could not read previous session back"),
        }
    }

    /// Stop renewing and wipe every session-scoped value.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        self.scheduler.cancel().await;
        self.store().clear().await?;

        info!("Logged out");
        self.scheduler.events().publish(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Pick up a persisted session at start-up.
    ///
    /// Returns the resumed credential, or `None` when nothing valid is stored.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<Option<Credential>> {
        let Some(credential) = self.store().get().await? else {
            debug!("No persisted session");
            return Ok(None);
        };

        let now = self.scheduler.clock().now_millis();
        if !credential.is_valid_at(now) {
            debug!(expires_at = credential.expires_at, "Persisted session has expired");
            return Ok(None);
        }

        info!(expires_at = credential.expires_at, "Resuming persisted session");
        self.scheduler.events().publish(SessionEvent::Resumed {
            expires_at: credential.expires_at,
        });

        if self.scheduler.schedule(credential.clone()).await == ScheduleOutcome::Skipped {
            debug!("Persisted session is too close to expiry to be renewed");
        }
        Ok(Some(credential))
    }

    /// The credential currently persisted, if any.
    pub async fn current_credential(&self) -> Result<Option<Credential>> {
        Ok(self.store().get().await?)
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        Ok(SessionStatus {
            credential: self.current_credential().await?,
            state: self.scheduler.state().await,
            last_failure: self.scheduler.last_failure().await,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.scheduler.events().subscribe()
    }

    pub fn scheduler(&self) -> &RenewalScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &CredentialStore {
        self.scheduler.store()
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
