//! Who is using the app: authenticated accounts and the local guest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use greenify_core::UserId;

use crate::config::SessionConfig;

/// Sentinel id shared by every guest identity.
pub const GUEST_USER_ID: &str = "guest-user";

/// Profile bag attached to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    pub name: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// What a user fills in on the sign-up form besides credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub name: String,
    pub location: String,
}

impl ProfileFields {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }
}

impl From<&ProfileFields> for UserMetadata {
    fn from(fields: &ProfileFields) -> Self {
        Self {
            name: fields.name.clone(),
            location: fields.location.clone(),
            avatar: None,
        }
    }
}

/// Account record issued by the external identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    pub id: UserId,
    pub email: String,
    pub metadata: UserMetadata,
    pub created_at: DateTime<Utc>,
}

/// Locally synthesized identity for guest mode.
///
/// Never sent to the identity service. Fields are private so the sentinel id
/// cannot be changed after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIdentity {
    id: String,
    email: String,
    metadata: UserMetadata,
}

impl GuestIdentity {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            id: GUEST_USER_ID.to_string(),
            email: config.guest_email.clone(),
            metadata: UserMetadata {
                name: config.guest_name.clone(),
                location: config.guest_location.clone(),
                avatar: Some(config.default_avatar_url.clone()),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn metadata(&self) -> &UserMetadata {
        &self.metadata
    }
}

/// The active user record, authenticated or guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Authenticated(AuthenticatedIdentity),
    Guest(GuestIdentity),
}

impl Identity {
    pub fn id(&self) -> String {
        match self {
            Identity::Authenticated(user) => user.id.to_string(),
            Identity::Guest(guest) => guest.id().to_string(),
        }
    }

    pub fn email(&self) -> &str {
        match self {
            Identity::Authenticated(user) => &user.email,
            Identity::Guest(guest) => guest.email(),
        }
    }

    pub fn metadata(&self) -> &UserMetadata {
        match self {
            Identity::Authenticated(user) => &user.metadata,
            Identity::Guest(guest) => guest.metadata(),
        }
    }

    /// Derived from the variant; there is no stored flag.
    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest(_))
    }
}
