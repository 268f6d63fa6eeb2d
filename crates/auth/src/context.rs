//! Session context: the process-wide source of truth for who is using the app.
//!
//! # Ordering
//!
//! Every state-producing step takes a ticket from one monotonically increasing
//! sequence: requests when they are issued, pushes when they are drained. A
//! result is applied only if its ticket is newer than the last applied one, so
//! a startup session fetch that resolves after a newer push is discarded.
//!
//! # Single writer
//!
//! The context is the only writer of [`SessionState`]. Sign-in results are not
//! assigned locally; they arrive as pushes from the identity service and go
//! through [`SessionContext::poll_notifications`] like every other push.
//!
//! # Guest exit
//!
//! Sign-in and sign-up from guest mode remove the guest marker before the
//! network call. While such a call is in flight, pushes that carry a session
//! may promote the guest; everything else leaves guest state alone. A failed
//! call puts the marker back so storage agrees with the (unchanged) state.
//!
//! Guest entry and guest sign-out are local transitions that move a floor. A
//! credential call issued below the floor no longer owns the outcome: its
//! session push does not promote the re-entered guest (or revive a signed-out
//! one), and its answer leaves the newer guest state and marker untouched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use greenify_events::{Event, EventBus, InMemoryEventBus, Subscription};

use crate::config::{GUEST_MARKER_VALUE, SessionConfig};
use crate::error::AuthResult;
use crate::identity::{AuthenticatedIdentity, GuestIdentity, Identity, ProfileFields, UserMetadata};
use crate::service::{AuthChange, AuthChangeKind, IdentityService, ProfileRecord, ProfileStore};
use crate::session::Session;
use crate::state::{SessionPhase, SessionState};
use crate::storage::LocalStore;

/// What caused a transition observers are told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// Startup resolved (marker found, or session fetch answered).
    Initialized,
    GuestEntered,
    /// Guest exit succeeded without a session being issued.
    GuestLeft,
    /// Local guest sign-out.
    SignedOut,
    /// Applied a push from the identity service.
    Notification(AuthChangeKind),
}

/// Snapshot published to observers after every applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub phase: SessionPhase,
    pub identity: Option<Identity>,
    pub cause: TransitionCause,
    pub occurred_at: DateTime<Utc>,
}

impl SessionEvent {
    fn snapshot(state: &SessionState, cause: TransitionCause) -> Self {
        Self {
            phase: state.phase(),
            identity: state.identity(),
            cause,
            occurred_at: Utc::now(),
        }
    }
}

impl Event for SessionEvent {
    fn event_type(&self) -> &'static str {
        match self.phase {
            SessionPhase::Anonymous => "session.anonymous",
            SessionPhase::Guest => "session.guest",
            SessionPhase::Authenticated => "session.authenticated",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: SessionState,
    /// Ticket of the last applied transition.
    applied: u64,
    loading: bool,
    /// Issue tickets of sign-in/sign-up calls still waiting for an answer.
    in_flight: Vec<u64>,
    /// Ticket of the last local transition (guest entry or guest sign-out).
    local_floor: u64,
}

impl Inner {
    /// A credential call issued during the current guest stint is pending.
    fn exiting_current_guest(&self) -> bool {
        self.in_flight.iter().any(|&t| t > self.local_floor)
    }

    /// Every pending credential call was issued before the last local
    /// transition.
    fn only_superseded_in_flight(&self) -> bool {
        !self.in_flight.is_empty() && self.in_flight.iter().all(|&t| t < self.local_floor)
    }
}

/// A sign-in/sign-up call between issue and answer.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    ticket: u64,
    leaving_guest: bool,
}

pub struct SessionContext {
    service: Arc<dyn IdentityService>,
    profiles: Arc<dyn ProfileStore>,
    store: Arc<dyn LocalStore>,
    config: SessionConfig,

    inner: RwLock<Inner>,
    sequence: AtomicU64,
    initialized: AtomicBool,

    changes: Mutex<Subscription<AuthChange>>,
    observers: InMemoryEventBus<SessionEvent>,
}

impl core::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionContext")
            .field("phase", &self.phase())
            .field("loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Build a context and register for session-change pushes right away, so
    /// nothing the service pushes before [`initialize`](Self::initialize) is
    /// lost.
    pub fn new(
        service: Arc<dyn IdentityService>,
        profiles: Arc<dyn ProfileStore>,
        store: Arc<dyn LocalStore>,
        config: SessionConfig,
    ) -> Self {
        let changes = service.subscribe();
        Self {
            service,
            profiles,
            store,
            config,
            inner: RwLock::new(Inner {
                loading: true,
                ..Inner::default()
            }),
            sequence: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            changes: Mutex::new(changes),
            observers: InMemoryEventBus::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── reads ────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.read_inner(|inner| inner.state.clone())
    }

    pub fn phase(&self) -> SessionPhase {
        self.read_inner(|inner| inner.state.phase())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read_inner(|inner| inner.state.identity())
    }

    pub fn session(&self) -> Option<Session> {
        self.read_inner(|inner| inner.state.session().cloned())
    }

    pub fn is_guest(&self) -> bool {
        self.read_inner(|inner| inner.state.is_guest())
    }

    /// True until startup has resolved.
    pub fn is_loading(&self) -> bool {
        self.read_inner(|inner| inner.loading)
    }

    /// Typed observer channel; one [`SessionEvent`] per applied transition.
    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.observers.subscribe()
    }

    // ── operations ───────────────────────────────────────────────────────

    /// Resolve the starting state. Runs once; later calls are ignored.
    ///
    /// A guest marker wins without touching the network. Otherwise the
    /// service is asked for an existing session; fetch failures and expired
    /// sessions both start the app anonymous.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            tracing::warn!("session context already initialized; ignoring");
            return;
        }

        if self.guest_marker_present() {
            let ticket = self.next_ticket();
            let guest = GuestIdentity::new(&self.config);
            self.commit(ticket, TransitionCause::Initialized, |inner| {
                inner.state = SessionState::Guest(guest);
                inner.local_floor = ticket;
                true
            });
            self.finish_loading();
            tracing::info!("restored guest session from local marker");
            return;
        }

        // Anything pushed before the fetch is issued is older than its answer.
        self.poll_notifications();

        let ticket = self.next_ticket();
        let session = match self.service.current_session().await {
            Ok(Some(session)) => match session.validate(Utc::now()) {
                Ok(()) => Some(session),
                Err(err) => {
                    tracing::warn!(error = %err, user_id = %session.user.id, "discarding stored session");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "session fetch failed; starting anonymous");
                None
            }
        };

        let applied = self.commit(ticket, TransitionCause::Initialized, |inner| {
            inner.state = SessionState::from(session);
            true
        });
        if !applied {
            tracing::debug!(ticket, "startup session fetch superseded");
        }

        self.finish_loading();
        tracing::info!(phase = %self.phase(), "session context initialized");
    }

    /// Create an account, leaving guest mode first if it is active.
    ///
    /// On success a profile record is written for the new account. A failed
    /// profile write is logged and does not fail the sign-up.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        fields: ProfileFields,
    ) -> AuthResult<AuthenticatedIdentity> {
        let request = self.begin_request();

        let result = self
            .service
            .sign_up(email, password, UserMetadata::from(&fields))
            .await;

        if let Ok(identity) = &result {
            self.create_profile(identity, &fields).await;
        }

        self.poll_notifications();
        self.end_request(request, result.is_ok());

        match &result {
            Ok(identity) => tracing::info!(user_id = %identity.id, "signed up"),
            Err(err) => tracing::warn!(error = %err, "sign-up failed"),
        }
        result
    }

    /// Verify credentials, leaving guest mode first if it is active.
    ///
    /// The identity itself updates through the push the service sends on
    /// success.
    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<()> {
        let request = self.begin_request();

        let result = self.service.sign_in(email, password).await;

        self.poll_notifications();
        self.end_request(request, result.is_ok());

        if let Err(err) = &result {
            tracing::warn!(error = %err, "sign-in failed");
        }
        result
    }

    /// Enter guest mode. Local only; cannot fail.
    ///
    /// Any session held in memory is dropped. A marker write failure is
    /// logged; the in-memory guest state still applies.
    pub fn sign_in_as_guest(&self) {
        let ticket = self.next_ticket();
        let guest = GuestIdentity::new(&self.config);
        self.commit(ticket, TransitionCause::GuestEntered, |inner| {
            self.write_guest_marker();
            inner.state = SessionState::Guest(guest);
            inner.local_floor = ticket;
            true
        });
        tracing::info!("entered guest mode");
    }

    /// Leave the current session.
    ///
    /// Guests are signed out locally and synchronously. Authenticated users
    /// are signed out by the service; the clear arrives as a push.
    pub async fn sign_out(&self) -> AuthResult<()> {
        let ticket = self.next_ticket();
        let was_guest = self.commit(ticket, TransitionCause::SignedOut, |inner| {
            if !inner.state.is_guest() {
                return false;
            }
            self.clear_guest_marker();
            inner.state = SessionState::Anonymous;
            inner.local_floor = ticket;
            true
        });
        if was_guest {
            tracing::info!("left guest mode");
            return Ok(());
        }

        if let Err(err) = self.service.sign_out().await {
            tracing::warn!(error = %err, "sign-out failed");
            return Err(err);
        }
        self.poll_notifications();
        Ok(())
    }

    /// Apply every push that has arrived so far. Returns how many were read.
    pub fn poll_notifications(&self) -> usize {
        let pending = self
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();

        let count = pending.len();
        for change in pending {
            self.apply_change(change);
        }
        count
    }

    /// Keep draining pushes in the background for as long as the context
    /// lives.
    pub fn spawn_notification_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = Arc::downgrade(self);
        let period = self.config.notification_poll_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(ctx) = ctx.upgrade() else {
                    tracing::debug!("session context dropped; stopping notification listener");
                    break;
                };
                ctx.poll_notifications();
            }
        })
    }

    // ── transitions ──────────────────────────────────────────────────────

    fn apply_change(&self, change: AuthChange) {
        let ticket = self.next_ticket();
        let event_type = change.event_type();
        let cause = TransitionCause::Notification(change.kind);

        let applied = self.commit(ticket, cause, |inner| {
            match change.session {
                Some(session) if inner.state.is_guest() => {
                    if !inner.exiting_current_guest() {
                        return false;
                    }
                    self.promote_to_authenticated(inner, session);
                }
                // Answer to a call issued before the user moved on locally.
                Some(_) if inner.only_superseded_in_flight() => return false,
                Some(session) => self.promote_to_authenticated(inner, session),
                None if inner.state.is_guest() => return false,
                None => inner.state = SessionState::Anonymous,
            }
            inner.loading = false;
            true
        });

        if applied {
            tracing::info!(event_type, ticket, phase = %self.phase(), "applied session change");
        } else {
            tracing::debug!(event_type, ticket, "ignored session change");
        }
    }

    /// The one transition into `Authenticated`. Guest state (variant and
    /// marker) is cleared in the same critical section, so no reader ever
    /// sees a guest with a session.
    fn promote_to_authenticated(&self, inner: &mut Inner, session: Session) {
        if inner.state.is_guest() {
            self.clear_guest_marker();
        }
        inner.state = SessionState::Authenticated(session);
    }

    /// Register a credential call. From guest mode the marker comes down
    /// before the call goes out.
    fn begin_request(&self) -> PendingRequest {
        let mut inner = self.write_inner();
        let ticket = self.next_ticket();
        inner.in_flight.push(ticket);

        let leaving_guest = inner.state.is_guest();
        if leaving_guest {
            self.clear_guest_marker();
        }
        PendingRequest {
            ticket,
            leaving_guest,
        }
    }

    /// Settle a credential call once it has answered.
    ///
    /// Bookkeeping always runs, whatever the ticket order: the in-flight
    /// list must not leak.
    fn end_request(&self, request: PendingRequest, succeeded: bool) {
        let ticket = self.next_ticket();
        let event = {
            let mut inner = self.write_inner();
            if let Some(pos) = inner.in_flight.iter().position(|&t| t == request.ticket) {
                inner.in_flight.swap_remove(pos);
            }

            if !request.leaving_guest || !inner.state.is_guest() {
                return;
            }
            if request.ticket < inner.local_floor {
                // Guest mode was entered again after this call went out.
                return;
            }
            if !succeeded {
                if !inner.exiting_current_guest() {
                    self.write_guest_marker();
                }
                return;
            }

            // Guest left, but no session has been pushed (yet).
            inner.state = SessionState::Anonymous;
            inner.applied = inner.applied.max(ticket);
            SessionEvent::snapshot(&inner.state, TransitionCause::GuestLeft)
        };
        self.publish(event);
    }

    /// Run `f` under the write lock if `ticket` is newer than the last
    /// applied transition. Observers hear about it when `f` returns true.
    fn commit<F>(&self, ticket: u64, cause: TransitionCause, f: F) -> bool
    where
        F: FnOnce(&mut Inner) -> bool,
    {
        let event = {
            let mut inner = self.write_inner();
            if ticket <= inner.applied {
                tracing::debug!(ticket, applied = inner.applied, "dropping stale transition");
                return false;
            }
            if !f(&mut *inner) {
                return false;
            }
            inner.applied = ticket;
            SessionEvent::snapshot(&inner.state, cause)
        };

        self.publish(event);
        true
    }

    fn publish(&self, event: SessionEvent) {
        if let Err(err) = self.observers.publish(event) {
            tracing::warn!(error = %err, "failed to notify session observers");
        }
    }

    fn finish_loading(&self) {
        self.write_inner().loading = false;
    }

    async fn create_profile(&self, identity: &AuthenticatedIdentity, fields: &ProfileFields) {
        let record =
            ProfileRecord::for_new_account(identity, fields, &self.config.default_avatar_url);
        if let Err(err) = self.profiles.insert(record).await {
            tracing::error!(user_id = %identity.id, error = %err, "error creating user profile");
        }
    }

    // ── guest marker ─────────────────────────────────────────────────────

    fn guest_marker_present(&self) -> bool {
        match self.store.get(&self.config.guest_marker_key) {
            Ok(value) => value.is_some_and(|v| !v.is_empty()),
            Err(err) => {
                tracing::warn!(error = %err, "could not read guest marker; assuming absent");
                false
            }
        }
    }

    fn write_guest_marker(&self) {
        if let Err(err) = self.store.set(&self.config.guest_marker_key, GUEST_MARKER_VALUE) {
            tracing::error!(error = %err, "failed to persist guest marker");
        }
    }

    fn clear_guest_marker(&self) {
        if let Err(err) = self.store.remove(&self.config.guest_marker_key) {
            tracing::error!(error = %err, "failed to remove guest marker");
        }
    }

    // ── plumbing ─────────────────────────────────────────────────────────

    fn next_ticket(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read_inner<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&*inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
