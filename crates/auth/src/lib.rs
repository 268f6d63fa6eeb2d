//! `greenify-auth` — session/identity context for the Greenify app.
//!
//! Owns who is using the app (nobody, a local guest, or an authenticated
//! account) and the transitions between those. Decoupled from any UI and
//! from any particular backend: the identity service and local storage are
//! traits.

pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod memory;
pub mod service;
pub mod session;
pub mod state;
pub mod storage;

pub use config::{GUEST_MARKER_KEY, GUEST_MARKER_VALUE, SessionConfig};
pub use context::{SessionContext, SessionEvent, TransitionCause};
pub use error::{AuthResult, ServiceError, StorageError};
pub use identity::{
    AuthenticatedIdentity, GUEST_USER_ID, GuestIdentity, Identity, ProfileFields, UserMetadata,
};
pub use memory::InMemoryIdentityService;
pub use service::{AuthChange, AuthChangeKind, IdentityService, ProfileRecord, ProfileStore};
pub use session::{Session, SessionValidationError};
pub use state::{SessionPhase, SessionState};
pub use storage::{FileStore, LocalStore, MemoryStore};
