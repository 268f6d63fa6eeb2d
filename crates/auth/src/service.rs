//! Contract of the external identity service.
//!
//! The session context only ever talks to these traits. A hosted
//! backend-as-a-service sits behind them in production;
//! [`InMemoryIdentityService`](crate::memory::InMemoryIdentityService) sits
//! behind them in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use greenify_core::UserId;
use greenify_events::{Event, Subscription};

use crate::error::AuthResult;
use crate::identity::{AuthenticatedIdentity, ProfileFields, UserMetadata};
use crate::session::Session;

/// Why the service pushed a session change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthChangeKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// A session change pushed by the identity service.
///
/// `session` is the service's view after the change; `None` means no
/// session any more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChange {
    pub kind: AuthChangeKind,
    pub session: Option<Session>,
    pub occurred_at: DateTime<Utc>,
}

impl AuthChange {
    pub fn new(kind: AuthChangeKind, session: Option<Session>) -> Self {
        Self {
            kind,
            session,
            occurred_at: Utc::now(),
        }
    }

    pub fn signed_in(session: Session) -> Self {
        Self::new(AuthChangeKind::SignedIn, Some(session))
    }

    pub fn signed_out() -> Self {
        Self::new(AuthChangeKind::SignedOut, None)
    }

    pub fn token_refreshed(session: Session) -> Self {
        Self::new(AuthChangeKind::TokenRefreshed, Some(session))
    }
}

impl Event for AuthChange {
    fn event_type(&self) -> &'static str {
        match self.kind {
            AuthChangeKind::SignedIn => "auth.signed_in",
            AuthChangeKind::SignedOut => "auth.signed_out",
            AuthChangeKind::TokenRefreshed => "auth.token_refreshed",
            AuthChangeKind::UserUpdated => "auth.user_updated",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Session issuance and credential checks.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Create an account. May or may not also start a session (the service
    /// pushes `SignedIn` if it does).
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: UserMetadata,
    ) -> AuthResult<AuthenticatedIdentity>;

    /// Verify credentials. The resulting session arrives as a push.
    async fn sign_in(&self, email: &str, password: &str) -> AuthResult<()>;

    /// The session the service currently holds for this device, if any.
    async fn current_session(&self) -> AuthResult<Option<Session>>;

    /// Register for session-change pushes. Dropping the subscription
    /// unsubscribes.
    fn subscribe(&self) -> Subscription<AuthChange>;

    /// End the current session. The clear arrives as a push.
    async fn sign_out(&self) -> AuthResult<()>;
}

/// Row in the service's user-profile table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub location: String,
    pub green_points: u64,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub avatar: String,
}

impl ProfileRecord {
    /// Starting profile for a freshly registered account: no points, no
    /// streaks, default avatar.
    pub fn for_new_account(
        identity: &AuthenticatedIdentity,
        fields: &ProfileFields,
        default_avatar_url: &str,
    ) -> Self {
        Self {
            id: identity.id,
            email: identity.email.clone(),
            name: fields.name.clone(),
            location: fields.location.clone(),
            green_points: 0,
            current_streak: 0,
            longest_streak: 0,
            avatar: default_avatar_url.to_string(),
        }
    }
}

/// User-profile record store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn insert(&self, record: ProfileRecord) -> AuthResult<()>;
}
