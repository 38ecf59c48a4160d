use super::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

const LIFETIME: Duration = Duration::from_secs(60);

fn recording_issuer() -> (TimedPermitIssuer<&'static str>, mpsc::UnboundedReceiver<(&'static str, Instant)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let issuer = TimedPermitIssuer::new(LIFETIME, move |target: &'static str| {
        let _ = tx.send((target, Instant::now()));
    });
    (issuer, rx)
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

#[tokio::test(start_paused = true)]
async fn test_permit_expires_one_lifetime_after_renewal() {
    let (issuer, mut rx) = recording_issuer();
    let permit = issuer.issue("a");
    assert_eq!(permit.state(), PermitState::Outstanding);

    sleep(Duration::from_secs(45)).await;
    let renewed_at = Instant::now();
    assert!(permit.renew());
    assert_eq!(permit.deadline(), Some(renewed_at + LIFETIME));

    // The original deadline passes without an expiry.
    sleep(Duration::from_secs(30)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(permit.state(), PermitState::Outstanding);

    sleep(Duration::from_secs(31)).await;
    let fired = drain(&mut rx);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].0, "a");
    let elapsed = fired[0].1 - renewed_at;
    assert!(elapsed >= LIFETIME && elapsed < LIFETIME + Duration::from_millis(5));
    assert_eq!(permit.state(), PermitState::Expired);

    sleep(LIFETIME * 5).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(issuer.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_succeeds_once_and_suppresses_expiry() {
    let (issuer, mut rx) = recording_issuer();
    let permit = issuer.issue("a");

    assert!(permit.cancel());
    assert!(!permit.cancel());
    assert_eq!(permit.state(), PermitState::Cancelled);
    assert_eq!(permit.deadline(), None);
    assert!(!permit.renew());

    sleep(LIFETIME * 2).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(issuer.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_renew_and_cancel_fail_after_expiry() {
    let (issuer, mut rx) = recording_issuer();
    let permit = issuer.issue("a");

    sleep(LIFETIME + Duration::from_secs(1)).await;
    assert_eq!(drain(&mut rx).len(), 1);
    assert!(!permit.renew());
    assert!(!permit.cancel());
    assert_eq!(permit.state(), PermitState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_reorders_expiry() {
    let (issuer, mut rx) = recording_issuer();
    let first = issuer.issue("first");
    sleep(Duration::from_secs(1)).await;
    let _second = issuer.issue("second");
    sleep(Duration::from_secs(1)).await;
    assert!(first.renew());

    sleep(LIFETIME + Duration::from_secs(5)).await;
    let order: Vec<&str> = drain(&mut rx).into_iter().map(|(target, _)| target).collect();
    assert_eq!(order, vec!["second", "first"]);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_permit_still_expires() {
    let (issuer, mut rx) = recording_issuer();
    drop(issuer.issue("dropped"));

    sleep(LIFETIME + Duration::from_secs(1)).await;
    assert_eq!(drain(&mut rx).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closed_issuer_cancels_everything() {
    let (issuer, mut rx) = recording_issuer();
    let a = issuer.issue("a");
    let b = issuer.issue("b");
    assert_eq!(issuer.outstanding(), 2);

    issuer.close();
    assert_eq!(a.state(), PermitState::Cancelled);
    assert_eq!(b.state(), PermitState::Cancelled);
    assert_eq!(issuer.outstanding(), 0);

    let late = issuer.issue("late");
    assert_eq!(late.state(), PermitState::Cancelled);
    assert!(!late.renew());

    sleep(LIFETIME * 2).await;
    assert!(drain(&mut rx).is_empty());
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<(&'static str, String)> {
        self.events.lock().clone()
    }
}

impl SessionListener for RecordingListener {
    fn session_created(&self, session: &Session) {
        self.events.lock().push(("created", session.key().to_string()));
    }

    fn session_destroyed(&self, session: &Session) {
        self.events.lock().push(("destroyed", session.key().to_string()));
    }

    fn session_expired(&self, session: &Session) {
        self.events.lock().push(("expired", session.key().to_string()));
    }
}

fn store_with_listener() -> (SessionStore, Arc<RecordingListener>) {
    let store = SessionStore::new(SessionConfig { lifetime: LIFETIME });
    let listener = Arc::new(RecordingListener::default());
    store.add_listener(listener.clone());
    (store, listener)
}

#[tokio::test(start_paused = true)]
async fn test_create_session_rejects_bound_key() {
    let (store, listener) = store_with_listener();

    let session = store.create_session("k").unwrap();
    assert_eq!(session.key(), "k");
    assert!(session.is_valid());
    assert!(!session.is_attached());
    assert!(store.create_session("k").is_none());
    assert_eq!(store.session_count(), 1);
    assert_eq!(listener.events(), vec![("created", "k".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_locate_session_returns_same_session_and_extends_expiry() {
    let (store, _listener) = store_with_listener();
    let created = store.create_session("k").unwrap();
    let first_deadline = created.expires_at().unwrap();

    sleep(Duration::from_secs(30)).await;
    let located = store.locate_session("k").unwrap();
    assert!(Arc::ptr_eq(&created, &located));
    let extended = located.expires_at().unwrap();
    assert!(extended > first_deadline);
    assert_eq!(extended, Instant::now() + LIFETIME);
    assert_eq!(located.last_accessed(), Instant::now());

    // Past the first deadline but inside the renewed one.
    sleep(Duration::from_secs(40)).await;
    assert!(store.locate_session("k").is_some());
    assert!(store.locate_session("missing").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_removes_and_notifies() {
    let (store, listener) = store_with_listener();
    let session = store.create_session("k").unwrap();

    sleep(LIFETIME + Duration::from_secs(1)).await;
    assert_eq!(store.session_count(), 0);
    assert!(!session.is_valid());
    assert_eq!(session.permit_state(), PermitState::Expired);
    assert!(store.locate_session("k").is_none());
    assert!(!session.destroy());
    assert_eq!(
        listener.events(),
        vec![("created", "k".to_string()), ("expired", "k".to_string())]
    );

    // The key is free again.
    assert!(store.create_session("k").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_destroy_session_fires_once() {
    let (store, listener) = store_with_listener();
    let session = store.create_session("k").unwrap();

    assert!(session.destroy());
    assert!(!session.destroy());
    assert!(!session.is_valid());
    assert_eq!(session.permit_state(), PermitState::Cancelled);
    assert_eq!(store.session_count(), 0);

    sleep(LIFETIME * 2).await;
    assert_eq!(
        listener.events(),
        vec![("created", "k".to_string()), ("destroyed", "k".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_destroys_every_session() {
    let (store, listener) = store_with_listener();
    let a = store.create_session("a").unwrap();
    let b = store.create_session("b").unwrap();

    store.close();
    assert!(store.is_closed());
    assert_eq!(store.session_count(), 0);
    assert!(!a.is_valid() && !b.is_valid());
    assert!(store.create_session("c").is_none());
    assert!(store.create_session_with_generated_key().is_none());

    sleep(LIFETIME * 2).await;
    let mut destroyed: Vec<String> = listener
        .events()
        .into_iter()
        .filter(|(kind, _)| *kind == "destroyed")
        .map(|(_, key)| key)
        .collect();
    destroyed.sort();
    assert_eq!(destroyed, vec!["a".to_string(), "b".to_string()]);
    assert!(listener.events().iter().all(|(kind, _)| *kind != "expired"));
}

#[tokio::test(start_paused = true)]
async fn test_generated_keys_are_unique_hex() {
    let store = SessionStore::default();
    let a = store.create_session_with_generated_key().unwrap();
    let b = store.create_session_with_generated_key().unwrap();

    assert_eq!(a.key().len(), 32);
    assert!(a.key().chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a.key(), b.key());
    assert_eq!(store.session_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_session_attributes() {
    let store = SessionStore::default();
    let session = store.create_session("k").unwrap();

    assert_eq!(session.set_attribute("user", "alice"), None);
    assert_eq!(session.set_attribute("user", "bob"), Some("alice".to_string()));
    session.set_attribute("cart", "3");
    assert_eq!(session.attribute("user").as_deref(), Some("bob"));
    assert_eq!(session.attribute_names(), vec!["cart".to_string(), "user".to_string()]);
    assert_eq!(session.remove_attribute("cart"), Some("3".to_string()));
    assert_eq!(session.attribute("cart"), None);
}
