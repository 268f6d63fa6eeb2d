use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use greenify_auth::{
    FileStore, GUEST_MARKER_KEY, IdentityService, InMemoryIdentityService, LocalStore,
    MemoryStore, ProfileFields, ServiceError, SessionConfig, SessionContext, SessionPhase,
    TransitionCause, UserMetadata,
};
use greenify_events::Event;

struct Harness {
    service: Arc<InMemoryIdentityService>,
    store: Arc<MemoryStore>,
    ctx: Arc<SessionContext>,
}

impl Harness {
    fn new() -> Self {
        Self::with_service(InMemoryIdentityService::new(), SessionConfig::default())
    }

    fn with_service(service: InMemoryIdentityService, config: SessionConfig) -> Self {
        greenify_observability::init();

        let service = Arc::new(service);
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(SessionContext::new(
            service.clone(),
            service.clone(),
            store.clone(),
            config,
        ));

        Self { service, store, ctx }
    }

    fn marker(&self) -> Option<String> {
        self.store.get(GUEST_MARKER_KEY).unwrap()
    }

    fn email(&self) -> Option<String> {
        self.ctx.identity().map(|i| i.email().to_string())
    }

    fn register(&self, email: &str, password: &str) {
        self.service
            .register(email, password, UserMetadata::from(&fields()));
    }
}

fn fields() -> ProfileFields {
    ProfileFields::new("Gia", "Nairobi")
}

#[tokio::test]
async fn fresh_start_guest_round_trip() {
    let h = Harness::new();
    assert!(h.ctx.is_loading());

    h.ctx.initialize().await;
    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert!(!h.ctx.is_loading());

    h.ctx.sign_in_as_guest();
    assert_eq!(h.ctx.phase(), SessionPhase::Guest);
    assert!(h.ctx.is_guest());
    assert_eq!(h.marker().as_deref(), Some("true"));
    assert_eq!(h.ctx.identity().map(|i| i.id()), Some("guest-user".to_string()));

    h.ctx.sign_out().await.unwrap();
    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert!(h.ctx.identity().is_none());
    assert_eq!(h.marker(), None);
}

#[tokio::test]
async fn guest_sign_up_promotes_to_authenticated() {
    let h = Harness::new();
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let identity = h
        .ctx
        .sign_up("a@b.com", "pw", ProfileFields::new("A", "X"))
        .await
        .unwrap();

    assert_eq!(h.marker(), None);
    assert_eq!(h.ctx.phase(), SessionPhase::Authenticated);
    assert!(!h.ctx.is_guest());
    assert_eq!(h.email().as_deref(), Some("a@b.com"));
    assert_eq!(h.ctx.session().map(|s| s.user.id), Some(identity.id));

    let profile = h.service.profile(&identity.id).unwrap();
    assert_eq!(profile.name, "A");
    assert_eq!(profile.location, "X");
    assert_eq!(profile.green_points, 0);
    assert_eq!(profile.current_streak, 0);
    assert_eq!(profile.longest_streak, 0);
    assert_eq!(profile.avatar, h.ctx.config().default_avatar_url);
}

#[tokio::test]
async fn remote_sign_out_push_ends_the_session() {
    let h = Harness::new();
    h.register("hal@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in("hal@example.com", "pw").await.unwrap();
    assert_eq!(h.ctx.phase(), SessionPhase::Authenticated);

    h.service.revoke_session();
    assert_eq!(h.ctx.poll_notifications(), 1);

    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert!(h.ctx.session().is_none());
}

#[tokio::test]
async fn token_refresh_replaces_the_session() {
    let h = Harness::new();
    h.register("hal@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in("hal@example.com", "pw").await.unwrap();
    let before = h.ctx.session().unwrap();

    let refreshed = h.service.refresh_session().unwrap();
    h.ctx.poll_notifications();

    let after = h.ctx.session().unwrap();
    assert_ne!(after.access_token, before.access_token);
    assert_eq!(after, refreshed);
}

#[tokio::test]
async fn failed_sign_in_leaves_anonymous_state_alone() {
    let h = Harness::new();
    h.register("ivy@example.com", "pw");
    h.ctx.initialize().await;

    let err = h.ctx.sign_in("ivy@example.com", "wrong").await.unwrap_err();

    assert!(matches!(err, ServiceError::InvalidCredentials(_)));
    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
}

#[tokio::test]
async fn failed_sign_in_keeps_the_current_account() {
    let h = Harness::new();
    h.register("ivy@example.com", "pw");
    h.register("jon@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in("ivy@example.com", "pw").await.unwrap();

    assert!(h.ctx.sign_in("jon@example.com", "wrong").await.is_err());

    assert_eq!(h.email().as_deref(), Some("ivy@example.com"));
}

#[tokio::test]
async fn failed_sign_in_from_guest_restores_the_marker() {
    let h = Harness::new();
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let err = h.ctx.sign_in("nobody@example.com", "pw").await.unwrap_err();

    assert!(matches!(err, ServiceError::InvalidCredentials(_)));
    assert!(h.ctx.is_guest());
    assert_eq!(h.marker().as_deref(), Some("true"));
}

#[tokio::test]
async fn failed_sign_up_from_guest_restores_the_marker() {
    let h = Harness::new();
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();
    h.service.set_unavailable(true);

    let err = h.ctx.sign_up("kim@example.com", "pw", fields()).await.unwrap_err();

    assert!(matches!(err, ServiceError::Unavailable(_)));
    assert!(h.ctx.is_guest());
    assert_eq!(h.marker().as_deref(), Some("true"));
    assert_eq!(h.service.profile_count(), 0);
}

#[tokio::test]
async fn guest_marker_is_gone_before_the_credential_call_lands() {
    let h = Harness::new();
    h.register("lea@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let gate = h.service.hold_credential_calls();
    let sign_in = h.ctx.sign_in("lea@example.com", "pw");
    let probe = async {
        tokio::task::yield_now().await;
        let seen = (h.marker(), h.ctx.is_guest());
        gate.notify_one();
        seen
    };

    let (result, (marker_in_flight, guest_in_flight)) = tokio::join!(sign_in, probe);

    result.unwrap();
    assert_eq!(marker_in_flight, None);
    assert!(guest_in_flight, "state must not change before the call answers");
    assert_eq!(h.email().as_deref(), Some("lea@example.com"));
}

#[tokio::test]
async fn guest_entry_drops_an_authenticated_session() {
    let h = Harness::new();
    h.register("max@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in("max@example.com", "pw").await.unwrap();

    h.ctx.sign_in_as_guest();

    assert!(h.ctx.is_guest());
    assert!(h.ctx.session().is_none());
    assert_eq!(h.email().as_deref(), Some("guest@greenify.com"));

    // The service still holds its session; its pushes must not override guest.
    h.service.refresh_session().unwrap();
    h.service.revoke_session();
    assert_eq!(h.ctx.poll_notifications(), 2);
    assert!(h.ctx.is_guest());
    assert_eq!(h.marker().as_deref(), Some("true"));
}

#[tokio::test]
async fn startup_prefers_the_guest_marker() {
    let h = Harness::new();
    h.register("ned@example.com", "pw");
    let ned = h.service.account("ned@example.com").unwrap();
    h.service.restore_session(&ned);
    h.store.set(GUEST_MARKER_KEY, "true").unwrap();

    h.ctx.initialize().await;

    assert!(h.ctx.is_guest());
    assert!(!h.ctx.is_loading());
}

#[tokio::test]
async fn startup_adopts_an_existing_session() {
    let h = Harness::new();
    h.register("ora@example.com", "pw");
    let ora = h.service.account("ora@example.com").unwrap();
    h.service.restore_session(&ora);

    h.ctx.initialize().await;

    assert_eq!(h.ctx.phase(), SessionPhase::Authenticated);
    assert_eq!(h.email().as_deref(), Some("ora@example.com"));
}

#[tokio::test]
async fn startup_fetch_failure_means_anonymous() {
    let h = Harness::new();
    h.service.set_unavailable(true);

    h.ctx.initialize().await;

    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert!(!h.ctx.is_loading());
}

#[tokio::test]
async fn startup_discards_an_unusable_session() {
    let h = Harness::with_service(
        InMemoryIdentityService::new().with_session_ttl(ChronoDuration::zero()),
        SessionConfig::default(),
    );
    h.register("pia@example.com", "pw");
    let pia = h.service.account("pia@example.com").unwrap();
    h.service.restore_session(&pia);

    h.ctx.initialize().await;

    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
}

#[tokio::test]
async fn stale_startup_fetch_does_not_override_a_newer_push() {
    let h = Harness::new();
    h.register("quin@example.com", "pw");
    h.register("rae@example.com", "pw");
    let quin = h.service.account("quin@example.com").unwrap();
    h.service.restore_session(&quin);

    let gate = h.service.hold_session_fetches();
    let init = h.ctx.initialize();
    let race = async {
        tokio::task::yield_now().await;
        // A newer session is pushed while the startup fetch is parked.
        h.service.sign_in("rae@example.com", "pw").await.unwrap();
        h.ctx.poll_notifications();
        gate.notify_one();
    };

    tokio::join!(init, race);

    assert_eq!(h.email().as_deref(), Some("rae@example.com"));
    assert!(!h.ctx.is_loading());
}

#[tokio::test]
async fn initialize_runs_once() {
    let h = Harness::new();
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    h.ctx.initialize().await;

    assert!(h.ctx.is_guest());
}

#[tokio::test]
async fn profile_write_failure_does_not_fail_sign_up() {
    let h = Harness::new();
    h.ctx.initialize().await;
    h.service
        .fail_profile_inserts(Some(ServiceError::unavailable("profiles table offline")));

    let identity = h.ctx.sign_up("sol@example.com", "pw", fields()).await.unwrap();

    assert_eq!(h.ctx.phase(), SessionPhase::Authenticated);
    assert!(h.service.profile(&identity.id).is_none());
    assert!(h.service.account("sol@example.com").is_some());
}

#[tokio::test]
async fn duplicate_sign_up_is_reported() {
    let h = Harness::new();
    h.register("tam@example.com", "pw");
    h.ctx.initialize().await;

    let err = h.ctx.sign_up("tam@example.com", "pw", fields()).await.unwrap_err();

    assert!(matches!(err, ServiceError::AlreadyRegistered(_)));
    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert_eq!(h.service.profile_count(), 0);
}

#[tokio::test]
async fn unconfirmed_sign_up_from_guest_leaves_guest_mode() {
    let h = Harness::with_service(
        InMemoryIdentityService::new().requiring_email_confirmation(),
        SessionConfig::default(),
    );
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();
    let events = h.ctx.subscribe();

    h.ctx.sign_up("uma@example.com", "pw", fields()).await.unwrap();

    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert_eq!(h.marker(), None);
    let causes: Vec<_> = events.drain().into_iter().map(|e| e.cause).collect();
    assert_eq!(causes, vec![TransitionCause::GuestLeft]);
}

#[tokio::test]
async fn authenticated_sign_out_failure_keeps_the_session() {
    let h = Harness::new();
    h.register("val@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in("val@example.com", "pw").await.unwrap();
    h.service.set_unavailable(true);

    assert!(h.ctx.sign_out().await.is_err());
    assert_eq!(h.ctx.phase(), SessionPhase::Authenticated);

    h.service.set_unavailable(false);
    h.ctx.sign_out().await.unwrap();
    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
}

#[tokio::test]
async fn observers_see_each_transition_in_order() {
    let h = Harness::new();
    h.register("wes@example.com", "pw");
    let events = h.ctx.subscribe();

    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();
    h.ctx.sign_in("wes@example.com", "pw").await.unwrap();
    h.ctx.sign_out().await.unwrap();

    let seen: Vec<_> = events
        .drain()
        .into_iter()
        .map(|e| (e.event_type(), e.cause))
        .collect();

    assert_eq!(
        seen,
        vec![
            ("session.anonymous", TransitionCause::Initialized),
            ("session.guest", TransitionCause::GuestEntered),
            (
                "session.authenticated",
                TransitionCause::Notification(greenify_auth::AuthChangeKind::SignedIn)
            ),
            (
                "session.anonymous",
                TransitionCause::Notification(greenify_auth::AuthChangeKind::SignedOut)
            ),
        ]
    );
}

#[tokio::test]
async fn background_listener_applies_remote_changes() {
    let config = SessionConfig {
        notification_poll_ms: 10,
        ..SessionConfig::default()
    };
    let h = Harness::with_service(InMemoryIdentityService::new(), config);
    h.register("xia@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in("xia@example.com", "pw").await.unwrap();

    let listener = h.ctx.spawn_notification_listener();
    h.service.revoke_session();

    let settled = tokio::time::timeout(Duration::from_secs(2), async {
        while h.ctx.phase() != SessionPhase::Anonymous {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    listener.abort();
    assert!(settled.is_ok(), "listener never applied the sign-out push");
}

#[tokio::test]
async fn guest_mode_survives_a_restart_with_the_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local_store.json");
    let service = Arc::new(InMemoryIdentityService::new());

    let first = SessionContext::new(
        service.clone(),
        service.clone(),
        Arc::new(FileStore::new(&path)),
        SessionConfig::default(),
    );
    first.initialize().await;
    first.sign_in_as_guest();
    drop(first);

    let second = SessionContext::new(
        service.clone(),
        service.clone(),
        Arc::new(FileStore::new(&path)),
        SessionConfig::default(),
    );
    second.initialize().await;
    assert!(second.is_guest());

    second.sign_out().await.unwrap();
    assert_eq!(FileStore::new(&path).get(GUEST_MARKER_KEY).unwrap(), None);
}

#[tokio::test]
async fn empty_guest_marker_counts_as_absent() {
    let h = Harness::new();
    h.store.set(GUEST_MARKER_KEY, "").unwrap();

    h.ctx.initialize().await;

    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert!(!h.ctx.is_loading());
}

#[tokio::test]
async fn guest_reentry_during_sign_in_wins_over_its_answer() {
    let h = Harness::new();
    h.register("lea@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let gate = h.service.hold_credential_calls();
    let sign_in = h.ctx.sign_in("lea@example.com", "pw");
    let reenter = async {
        tokio::task::yield_now().await;
        h.ctx.sign_in_as_guest();
        gate.notify_one();
    };
    let (result, ()) = tokio::join!(sign_in, reenter);

    result.unwrap();
    assert_eq!(h.ctx.phase(), SessionPhase::Guest);
    assert_eq!(h.marker().as_deref(), Some("true"));
    assert_eq!(h.email().as_deref(), Some("guest@greenify.com"));
}

#[tokio::test]
async fn guest_reentry_during_unconfirmed_sign_up_keeps_the_marker() {
    let h = Harness::with_service(
        InMemoryIdentityService::new().requiring_email_confirmation(),
        SessionConfig::default(),
    );
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let gate = h.service.hold_credential_calls();
    let sign_up = h.ctx.sign_up("uma@example.com", "pw", fields());
    let reenter = async {
        tokio::task::yield_now().await;
        h.ctx.sign_in_as_guest();
        gate.notify_one();
    };
    let (result, ()) = tokio::join!(sign_up, reenter);

    result.unwrap();
    assert!(h.service.account("uma@example.com").is_some());
    assert!(h.ctx.is_guest());
    assert_eq!(h.marker().as_deref(), Some("true"));
}

#[tokio::test]
async fn guest_reentry_during_failed_sign_in_keeps_the_marker() {
    let h = Harness::new();
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let gate = h.service.hold_credential_calls();
    let sign_in = h.ctx.sign_in("nobody@example.com", "pw");
    let reenter = async {
        tokio::task::yield_now().await;
        h.ctx.sign_in_as_guest();
        gate.notify_one();
    };
    let (result, ()) = tokio::join!(sign_in, reenter);

    assert!(result.is_err());
    assert!(h.ctx.is_guest());
    assert_eq!(h.marker().as_deref(), Some("true"));
}

#[tokio::test]
async fn guest_sign_out_during_sign_in_is_not_undone() {
    let h = Harness::new();
    h.register("lea@example.com", "pw");
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let gate = h.service.hold_credential_calls();
    let sign_in = h.ctx.sign_in("lea@example.com", "pw");
    let sign_out = async {
        tokio::task::yield_now().await;
        h.ctx.sign_out().await.unwrap();
        gate.notify_one();
    };
    let (result, ()) = tokio::join!(sign_in, sign_out);

    result.unwrap();
    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert_eq!(h.marker(), None);
}

#[tokio::test]
async fn guest_sign_out_during_failed_sign_in_leaves_no_marker() {
    let h = Harness::new();
    h.ctx.initialize().await;
    h.ctx.sign_in_as_guest();

    let gate = h.service.hold_credential_calls();
    let sign_in = h.ctx.sign_in("nobody@example.com", "pw");
    let sign_out = async {
        tokio::task::yield_now().await;
        h.ctx.sign_out().await.unwrap();
        gate.notify_one();
    };
    let (result, ()) = tokio::join!(sign_in, sign_out);

    assert!(result.is_err());
    assert_eq!(h.ctx.phase(), SessionPhase::Anonymous);
    assert_eq!(h.marker(), None);
}
