//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{AuthenticatedUser, Authenticator, LoginOutcome, RenewalClient};
use crate::clock::{Clock, TokioClock};
use crate::credential::Credential;
use crate::error::{AuthError, RenewalError, StoreError};
use crate::store::{KeyValueStore, MemoryStore};

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub enum Reply {
    /// Issue `tok-<call>` expiring this many milliseconds after the response.
    Lifetime(i64),
    Fail(RenewalError),
}

/// Renewal client answering from a fixed script.
pub struct ScriptedClient {
    clock: Arc<TokioClock>,
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedClient {
    pub fn new(clock: Arc<TokioClock>, replies: Vec<Reply>) -> Self {
        Self {
            clock,
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tokens presented to `renew`, in call order.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl RenewalClient for ScriptedClient {
    async fn renew(&self, current: &Credential) -> Result<Credential, RenewalError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().push(current.token.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Lifetime(lifetime)) => Ok(Credential::new(
                format!("tok-{call}"),
                self.clock.now_millis() + lifetime,
            )),
            Some(Reply::Fail(error)) => Err(error),
            None => Err(RenewalError::NoResponse("script exhausted".into())),
        }
    }
}

/// Authenticator accepting a single password.
pub struct FakeAuthenticator {
    clock: Arc<TokioClock>,
    password: String,
    lifetime: i64,
    logins: AtomicUsize,
}

impl FakeAuthenticator {
    pub fn new(clock: Arc<TokioClock>, password: &str, lifetime: i64) -> Self {
        Self {
            clock,
            password: password.to_string(),
            lifetime,
            logins: AtomicUsize::new(0),
        }
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        if password != self.password {
            return Err(AuthError::rejected(401, "bad credentials"));
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(LoginOutcome {
            user: AuthenticatedUser {
                username: username.to_string(),
                ..AuthenticatedUser::default()
            },
            credential: Credential::new(
                format!("login-{n}"),
                self.clock.now_millis() + self.lifetime,
            ),
        })
    }
}

/// In-memory backend whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set_many(entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.clear().await
    }
}
