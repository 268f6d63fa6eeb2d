//! The three-way session state and its derived views.

use serde::{Deserialize, Serialize};

use crate::identity::{GuestIdentity, Identity};
use crate::session::Session;

/// Current session state.
///
/// # Invariants
/// - Exactly one variant is active; Guest and Authenticated never co-exist.
/// - A session exists only in `Authenticated`.
/// - Guest-ness is the variant itself, so nothing can fall out of sync with it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "phase", content = "data", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Anonymous,
    Guest(GuestIdentity),
    Authenticated(Session),
}

/// Payload-free view of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Anonymous,
    Guest,
    Authenticated,
}

impl core::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SessionPhase::Anonymous => write!(f, "anonymous"),
            SessionPhase::Guest => write!(f, "guest"),
            SessionPhase::Authenticated => write!(f, "authenticated"),
        }
    }
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Anonymous => SessionPhase::Anonymous,
            SessionState::Guest(_) => SessionPhase::Guest,
            SessionState::Authenticated(_) => SessionPhase::Authenticated,
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        match self {
            SessionState::Anonymous => None,
            SessionState::Guest(guest) => Some(Identity::Guest(guest.clone())),
            SessionState::Authenticated(session) => {
                Some(Identity::Authenticated(session.user.clone()))
            }
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, SessionState::Guest(_))
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }
}

impl From<Option<Session>> for SessionState {
    fn from(session: Option<Session>) -> Self {
        match session {
            Some(session) => SessionState::Authenticated(session),
            None => SessionState::Anonymous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use greenify_core::UserId;

    use crate::config::SessionConfig;
    use crate::identity::{AuthenticatedIdentity, ProfileFields, UserMetadata};

    fn session() -> Session {
        let now = Utc::now();
        Session {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            issued_at: now,
            expires_at: now + Duration::hours(1),
            user: AuthenticatedIdentity {
                id: UserId::new(),
                email: "cy@example.com".to_string(),
                metadata: UserMetadata::from(&ProfileFields::new("Cy", "Quito")),
                created_at: now,
            },
        }
    }

    #[test]
    fn anonymous_has_nothing() {
        let state = SessionState::default();
        assert_eq!(state.phase(), SessionPhase::Anonymous);
        assert!(state.identity().is_none());
        assert!(state.session().is_none());
        assert!(!state.is_guest());
    }

    #[test]
    fn guest_has_identity_but_no_session() {
        let state = SessionState::Guest(GuestIdentity::new(&SessionConfig::default()));
        assert_eq!(state.phase(), SessionPhase::Guest);
        assert!(state.is_guest());
        assert!(state.session().is_none());
        assert!(state.identity().is_some_and(|i| i.is_guest()));
    }

    #[test]
    fn authenticated_identity_comes_from_the_session() {
        let s = session();
        let state = SessionState::from(Some(s.clone()));

        assert!(state.is_authenticated());
        assert!(!state.is_guest());
        assert_eq!(state.session(), Some(&s));
        assert_eq!(
            state.identity().map(|i| i.email().to_string()),
            Some("cy@example.com".to_string())
        );
    }

    #[test]
    fn missing_session_maps_to_anonymous() {
        assert_eq!(SessionState::from(None), SessionState::Anonymous);
    }

    #[test]
    fn phase_display_is_lowercase() {
        assert_eq!(SessionPhase::Authenticated.to_string(), "authenticated");
        assert_eq!(SessionPhase::Guest.to_string(), "guest");
    }
}
