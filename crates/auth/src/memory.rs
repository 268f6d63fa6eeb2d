//! In-memory identity service.
//!
//! Implements both [`IdentityService`] and [`ProfileStore`]. Intended for
//! tests/dev: accounts, the device session and the profile table live in
//! process memory, and pushes go out over an [`InMemoryEventBus`].
//!
//! Test hooks:
//! - fault injection (`set_unavailable`, `fail_profile_inserts`)
//! - gates (`hold_session_fetches`, `hold_credential_calls`) that park a call
//!   until released, to observe the context while a request is in flight;
//!   `release_gates` stops parking new calls
//! - remote events (`refresh_session`, `revoke_session`, `push`)

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use greenify_core::UserId;
use greenify_events::{Event, EventBus, InMemoryEventBus, Subscription};

use crate::error::{AuthResult, ServiceError};
use crate::identity::{AuthenticatedIdentity, UserMetadata};
use crate::service::{AuthChange, IdentityService, ProfileRecord, ProfileStore};
use crate::session::Session;

#[derive(Debug, Clone)]
struct Account {
    password: String,
    identity: AuthenticatedIdentity,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    profile_insert: Option<ServiceError>,
    session_gate: Option<Arc<Notify>>,
    credential_gate: Option<Arc<Notify>>,
}

#[derive(Debug)]
pub struct InMemoryIdentityService {
    accounts: RwLock<HashMap<String, Account>>,
    current: RwLock<Option<Session>>,
    profiles: RwLock<HashMap<UserId, ProfileRecord>>,
    changes: InMemoryEventBus<AuthChange>,
    faults: Mutex<Faults>,
    session_ttl: Duration,
    confirm_on_sign_up: bool,
}

impl Default for InMemoryIdentityService {
    fn default() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            profiles: RwLock::new(HashMap::new()),
            changes: InMemoryEventBus::new(),
            faults: Mutex::new(Faults::default()),
            session_ttl: Duration::hours(1),
            confirm_on_sign_up: true,
        }
    }
}

impl InMemoryIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Sign-ups create the account but start no session (email confirmation
    /// flow).
    pub fn requiring_email_confirmation(mut self) -> Self {
        self.confirm_on_sign_up = false;
        self
    }

    /// Create an account directly, without a session or a push.
    pub fn register(
        &self,
        email: &str,
        password: &str,
        metadata: UserMetadata,
    ) -> AuthenticatedIdentity {
        let identity = AuthenticatedIdentity {
            id: UserId::new(),
            email: email.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        write(&self.accounts).insert(
            normalize(email),
            Account {
                password: password.to_string(),
                identity: identity.clone(),
            },
        );
        identity
    }

    /// Pretend the device already holds a session for `identity` (as after a
    /// previous run). No push is sent.
    pub fn restore_session(&self, identity: &AuthenticatedIdentity) -> Session {
        let session = self.issue(identity.clone());
        *write(&self.current) = Some(session.clone());
        session
    }

    /// Rotate the current session's tokens and push `TokenRefreshed`.
    pub fn refresh_session(&self) -> Option<Session> {
        let user = read(&self.current).as_ref().map(|s| s.user.clone())?;
        let session = self.issue(user);
        *write(&self.current) = Some(session.clone());
        self.push(AuthChange::token_refreshed(session.clone()));
        Some(session)
    }

    /// End the session from the service side and push `SignedOut`.
    pub fn revoke_session(&self) {
        *write(&self.current) = None;
        self.push(AuthChange::signed_out());
    }

    /// Push an arbitrary change to every subscriber.
    pub fn push(&self, change: AuthChange) {
        if let Err(err) = self.changes.publish(change.clone()) {
            tracing::warn!(event_type = change.event_type(), error = %err, "failed to push session change");
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.faults).unavailable = unavailable;
    }

    /// Make every profile insert fail with `err` (`None` to stop).
    pub fn fail_profile_inserts(&self, err: Option<ServiceError>) {
        lock(&self.faults).profile_insert = err;
    }

    /// Park `current_session` calls after they read the session until the
    /// returned handle is notified. The response reflects the moment the
    /// call was made, not the moment it is released.
    pub fn hold_session_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.faults).session_gate = Some(gate.clone());
        gate
    }

    /// Park `sign_in`/`sign_up` calls before they do anything until the
    /// returned handle is notified.
    pub fn hold_credential_calls(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.faults).credential_gate = Some(gate.clone());
        gate
    }

    /// Stop parking calls. Calls already parked still wait for their handle.
    pub fn release_gates(&self) {
        let mut faults = lock(&self.faults);
        faults.session_gate = None;
        faults.credential_gate = None;
    }

    pub fn current(&self) -> Option<Session> {
        read(&self.current).clone()
    }

    pub fn profile(&self, id: &UserId) -> Option<ProfileRecord> {
        read(&self.profiles).get(id).cloned()
    }

    pub fn profile_count(&self) -> usize {
        read(&self.profiles).len()
    }

    pub fn account(&self, email: &str) -> Option<AuthenticatedIdentity> {
        read(&self.accounts)
            .get(&normalize(email))
            .map(|a| a.identity.clone())
    }

    fn issue(&self, user: AuthenticatedIdentity) -> Session {
        let now = Utc::now();
        Session {
            access_token: Uuid::now_v7().to_string(),
            refresh_token: Uuid::now_v7().to_string(),
            issued_at: now,
            expires_at: now + self.session_ttl,
            user,
        }
    }

    fn start_session(&self, user: AuthenticatedIdentity) {
        let session = self.issue(user);
        *write(&self.current) = Some(session.clone());
        self.push(AuthChange::signed_in(session));
    }

    fn ensure_available(&self) -> AuthResult<()> {
        if lock(&self.faults).unavailable {
            return Err(ServiceError::unavailable("connection refused"));
        }
        Ok(())
    }

    async fn pass_gate(&self, gate: Option<Arc<Notify>>) {
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl IdentityService for InMemoryIdentityService {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: UserMetadata,
    ) -> AuthResult<AuthenticatedIdentity> {
        let gate = lock(&self.faults).credential_gate.clone();
        self.pass_gate(gate).await;
        self.ensure_available()?;

        if self.account(email).is_some() {
            return Err(ServiceError::AlreadyRegistered(email.to_string()));
        }
        let identity = self.register(email, password, metadata);

        if self.confirm_on_sign_up {
            self.start_session(identity.clone());
        }
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> AuthResult<()> {
        let gate = lock(&self.faults).credential_gate.clone();
        self.pass_gate(gate).await;
        self.ensure_available()?;

        let account = read(&self.accounts).get(&normalize(email)).cloned();
        match account {
            Some(account) if account.password == password => {
                self.start_session(account.identity);
                Ok(())
            }
            _ => Err(ServiceError::invalid_credentials("invalid login credentials")),
        }
    }

    async fn current_session(&self) -> AuthResult<Option<Session>> {
        self.ensure_available()?;
        let snapshot = read(&self.current).clone();

        let gate = lock(&self.faults).session_gate.clone();
        self.pass_gate(gate).await;
        Ok(snapshot)
    }

    fn subscribe(&self) -> Subscription<AuthChange> {
        self.changes.subscribe()
    }

    async fn sign_out(&self) -> AuthResult<()> {
        self.ensure_available()?;
        self.revoke_session();
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for InMemoryIdentityService {
    async fn insert(&self, record: ProfileRecord) -> AuthResult<()> {
        if let Some(err) = lock(&self.faults).profile_insert.clone() {
            return Err(err);
        }

        let mut profiles = write(&self.profiles);
        if profiles.contains_key(&record.id) {
            return Err(ServiceError::rejected(format!(
                "duplicate key: profile {} already exists",
                record.id
            )));
        }
        profiles.insert(record.id, record);
        Ok(())
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

// Test double: a panic while holding a lock should not cascade into every
// later assertion, so poisoned guards are recovered.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
