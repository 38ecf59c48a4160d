use super::engine::{decide, resolve_location};
use super::*;
use crate::WireError;
use crate::codec::MessageCodec;
use crate::message::{Body, Request, Response};
use futures::{SinkExt, StreamExt};
use http::{Method, StatusCode, Uri};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::codec::Framed;

struct FakeConnection {
    id: u64,
    destination: Destination,
    reusable: bool,
}

impl Pooled for FakeConnection {
    fn id(&self) -> ConnectionId {
        ConnectionId(self.id)
    }

    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn is_reusable(&self) -> bool {
        self.reusable
    }
}

fn example() -> Destination {
    Destination::new("http", "example.com", 80)
}

fn fake(id: u64) -> FakeConnection {
    FakeConnection {
        id,
        destination: example(),
        reusable: true,
    }
}

#[test]
fn test_destination_from_uri() {
    let uri: Uri = "http://Example.COM/path".parse().unwrap();
    assert_eq!(Destination::from_uri(&uri).unwrap(), example());

    let uri: Uri = "https://example.com:8443/".parse().unwrap();
    let destination = Destination::from_uri(&uri).unwrap();
    assert_eq!(destination.port(), 8443);
    assert_eq!(destination.to_string(), "https://example.com:8443");

    let relative: Uri = "/only/a/path".parse().unwrap();
    assert!(matches!(Destination::from_uri(&relative), Err(WireError::InvalidUri(_))));
}

#[test]
fn test_pool_acquire_returns_most_recent() {
    let pool = ConnectionPool::new(PoolConfig::default());
    assert!(pool.release(fake(1)));
    assert!(pool.release(fake(2)));
    assert_eq!(pool.idle_count_for(&example()), 2);

    assert_eq!(pool.acquire(&example()).unwrap().id, 2);
    assert_eq!(pool.acquire(&example()).unwrap().id, 1);
    assert!(pool.acquire(&example()).is_none());
    assert!(pool.acquire(&Destination::new("http", "other.org", 80)).is_none());
}

#[test]
fn test_pool_refuses_unusable_connections() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let mut busy = fake(1);
    busy.reusable = false;
    assert!(!pool.release(busy));
    assert_eq!(pool.idle_count(), 0);

    let disabled = ConnectionPool::new(PoolConfig {
        max_idle_per_destination: 0,
        ..Default::default()
    });
    assert!(!disabled.release(fake(2)));
}

#[test]
fn test_pool_evicts_oldest_beyond_limit() {
    let pool = ConnectionPool::new(PoolConfig {
        max_idle_per_destination: 2,
        idle_timeout: None,
    });
    for id in 1..=3 {
        assert!(pool.release(fake(id)));
    }
    assert_eq!(pool.idle_count(), 2);
    assert_eq!(pool.acquire(&example()).unwrap().id, 3);
    assert_eq!(pool.acquire(&example()).unwrap().id, 2);
}

#[test]
fn test_pool_invalidate_and_clear() {
    let pool = ConnectionPool::new(PoolConfig::default());
    pool.release(fake(1));
    pool.release(fake(2));

    assert!(pool.invalidate(ConnectionId(1)));
    assert!(!pool.invalidate(ConnectionId(1)));
    assert_eq!(pool.idle_count(), 1);

    pool.clear();
    assert_eq!(pool.idle_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pool_discards_expired_connections() {
    let pool = ConnectionPool::new(PoolConfig {
        max_idle_per_destination: 4,
        idle_timeout: Some(Duration::from_secs(10)),
    });
    pool.release(fake(1));
    tokio::time::advance(Duration::from_secs(5)).await;
    pool.release(fake(2));
    tokio::time::advance(Duration::from_secs(6)).await;

    assert_eq!(pool.acquire(&example()).unwrap().id, 2);
    assert!(pool.acquire(&example()).is_none());
    assert_eq!(pool.idle_count(), 0);
}

#[tokio::test]
async fn test_completion_resolves_once() {
    let (completion, future) = Completion::new();
    assert!(completion.complete(Ok(Response::ok("first"))));
    assert!(!completion.complete(Err(WireError::Timeout("late".to_string()))));
    assert!(completion.is_complete());

    let response = future.await.unwrap();
    assert_eq!(response.body().to_bytes(), "first");
}

#[tokio::test]
async fn test_dropped_completion_cancels_future() {
    let (completion, future) = Completion::new();
    drop(completion);
    assert!(matches!(future.await, Err(WireError::Cancelled)));
}

#[test]
fn test_completion_sees_abandoned_future() {
    let (completion, future) = Completion::new();
    assert!(!completion.is_abandoned());
    drop(future);
    assert!(completion.is_abandoned());
}

fn redirect(status: StatusCode, location: &str) -> Response {
    Response::builder(status).header("location", location).body("").build()
}

fn challenge(value: &str) -> Response {
    Response::builder(StatusCode::UNAUTHORIZED)
        .header("www-authenticate", value)
        .body("")
        .build()
}

fn post_form() -> Request {
    Request::builder()
        .method(Method::POST)
        .uri("http://example.com/form?a=1")
        .body("field=value")
        .build()
        .unwrap()
}

#[test]
fn test_redirect_rewrites_request() {
    let config = ClientConfig::default();
    for status in [StatusCode::MOVED_PERMANENTLY, StatusCode::FOUND, StatusCode::TEMPORARY_REDIRECT] {
        let mut request = post_form();
        let disposition = decide(&mut request, &redirect(status, "/landing"), &config, 0).unwrap();

        assert_eq!(disposition, Disposition::Redirect, "{status}");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri(), "http://example.com/landing");
        assert!(request.params().is_empty());
        assert_eq!(request.body(), &Body::Empty);
        assert!(request.header("content-length").is_none());
    }
}

#[test]
fn test_redirect_respects_follow_flag_and_status() {
    let config = ClientConfig::default();

    let mut request = post_form();
    request.set_follow_redirects(false);
    let disposition = decide(&mut request, &redirect(StatusCode::FOUND, "/x"), &config, 0).unwrap();
    assert_eq!(disposition, Disposition::Complete);
    assert_eq!(request.method(), Method::POST);

    let mut request = post_form();
    let disposition = decide(&mut request, &redirect(StatusCode::SEE_OTHER, "/x"), &config, 0).unwrap();
    assert_eq!(disposition, Disposition::Complete);

    let mut request = post_form();
    let no_location = Response::builder(StatusCode::FOUND).body("").build();
    assert_eq!(decide(&mut request, &no_location, &config, 0).unwrap(), Disposition::Complete);
}

#[test]
fn test_redirect_limit() {
    let config = ClientConfigBuilder::new().max_redirects(2).build();
    let mut request = Request::get("http://example.com/").unwrap();
    let response = redirect(StatusCode::FOUND, "/again");

    assert_eq!(decide(&mut request, &response, &config, 1).unwrap(), Disposition::Redirect);
    assert_eq!(decide(&mut request, &response, &config, 2).unwrap(), Disposition::Complete);
}

#[test]
fn test_cross_origin_redirect_drops_authentication() {
    let config = ClientConfigBuilder::new().credentials("user", "pass").build();
    let mut request = Request::get("http://example.com/").unwrap();
    decide(&mut request, &challenge("Basic realm=\"r\""), &config, 0).unwrap();
    assert!(request.auth_state().is_some());

    decide(&mut request, &redirect(StatusCode::FOUND, "http://other.org/"), &config, 0).unwrap();
    assert!(request.auth_state().is_none());
    assert_eq!(request.uri(), "http://other.org/");
}

#[test]
fn test_resolve_location() {
    let base: Uri = "http://example.com:8080/docs/guide/intro?x=1".parse().unwrap();
    let cases = [
        ("https://other.org/a", "https://other.org/a"),
        ("//cdn.example.com/lib.js", "http://cdn.example.com/lib.js"),
        ("/root?y=2", "http://example.com:8080/root?y=2"),
        ("chapter2", "http://example.com:8080/docs/guide/chapter2"),
        (
            "/login?next=http://example.com/a",
            "http://example.com:8080/login?next=http://example.com/a",
        ),
        ("search?q=a:b", "http://example.com:8080/docs/guide/search?q=a:b"),
    ];
    for (location, expected) in cases {
        assert_eq!(resolve_location(&base, location).unwrap(), expected, "{location}");
    }
}

#[test]
fn test_auth_retries_are_capped() {
    let config = ClientConfigBuilder::new().credentials("user", "pass").build();
    let mut request = Request::get("http://example.com/private").unwrap();
    let response = challenge("Basic realm=\"private\"");

    for expected in 1..=3 {
        let disposition = decide(&mut request, &response, &config, 0).unwrap();
        assert_eq!(disposition, Disposition::AuthRetry { attempt: expected });
        assert_eq!(request.auth_attempts(), expected);
    }
    assert_eq!(decide(&mut request, &response, &config, 0).unwrap(), Disposition::Complete);

    let state = request.auth_state().unwrap();
    assert_eq!(state.scheme(), "Basic");
    assert_eq!(state.authorization(), "Basic dXNlcjpwYXNz");
}

#[test]
fn test_auth_cap_is_configurable() {
    let config = ClientConfigBuilder::new()
        .credentials("user", "pass")
        .max_auth_attempts(1)
        .build();
    let mut request = Request::get("http://example.com/").unwrap();
    let response = challenge("Basic realm=\"r\"");
    assert_eq!(decide(&mut request, &response, &config, 0).unwrap(), Disposition::AuthRetry { attempt: 1 });
    assert_eq!(decide(&mut request, &response, &config, 0).unwrap(), Disposition::Complete);
}

#[test]
fn test_challenge_without_handler_or_credentials_completes() {
    let mut request = Request::get("http://example.com/").unwrap();
    let anonymous = ClientConfig::default();
    assert_eq!(
        decide(&mut request, &challenge("Basic realm=\"r\""), &anonymous, 0).unwrap(),
        Disposition::Complete
    );

    let config = ClientConfigBuilder::new().credentials("user", "pass").build();
    assert_eq!(
        decide(&mut request, &challenge("Negotiate"), &config, 0).unwrap(),
        Disposition::Complete
    );
    assert!(request.auth_state().is_none());
    assert_eq!(request.auth_attempts(), 0);
}

#[test]
fn test_request_credentials_win_over_config() {
    let config = ClientConfigBuilder::new().credentials("default", "x").build();
    let mut request = Request::builder()
        .uri("http://example.com/")
        .credentials(Credentials::new("user", "pass"))
        .build()
        .unwrap();
    decide(&mut request, &challenge("basic realm=\"r\""), &config, 0).unwrap();
    assert_eq!(request.auth_state().unwrap().authorization(), "Basic dXNlcjpwYXNz");
}

#[test]
fn test_challenge_parse() {
    let challenge = Challenge::parse("Digest realm=\"api\", nonce=\"abc\", qop=auth").unwrap();
    assert_eq!(challenge.scheme(), "Digest");
    assert_eq!(challenge.param("realm"), Some("api"));
    assert_eq!(challenge.param("NONCE"), Some("abc"));
    assert_eq!(challenge.param("qop"), Some("auth"));
    assert_eq!(challenge.param("missing"), None);
    assert!(Challenge::parse("   ").is_none());
}

#[test]
fn test_credentials_debug_hides_password() {
    let rendered = format!("{:?}", Credentials::new("user", "hunter2"));
    assert!(rendered.contains("user"));
    assert!(!rendered.contains("hunter2"));
}

#[test]
fn test_client_config_builder() {
    let config = ClientConfigBuilder::new()
        .read_timeout(Duration::from_secs(60))
        .write_timeout(Duration::from_secs(5))
        .request_timeout(Duration::from_secs(90))
        .max_idle_per_destination(2)
        .max_response_size(1024)
        .user_agent(None)
        .build();

    assert_eq!(config.read_timeout, Duration::from_secs(60));
    assert_eq!(config.write_timeout, Duration::from_secs(5));
    assert_eq!(config.request_timeout, Some(Duration::from_secs(90)));
    assert_eq!(config.pool.max_idle_per_destination, 2);
    assert_eq!(config.limits.max_body_size, 1024);
    assert_eq!(config.max_auth_attempts, 3);
    assert_eq!(config.max_redirects, None);
    assert!(config.user_agent.is_none());
}

/// What the scripted peer does with a request.
enum Action {
    Respond(Response),
    RespondAndClose(Response),
    Hang,
    Close,
}

/// Connector whose transports lead to an in-memory server answering from a script.
struct ScriptedConnector {
    connects: AtomicUsize,
    seen: Arc<Mutex<Vec<Request>>>,
    script: Arc<dyn Fn(&Request) -> Action + Send + Sync>,
}

impl ScriptedConnector {
    fn new(script: impl Fn(&Request) -> Action + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(script),
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<Request> {
        self.seen.lock().clone()
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _destination: &Destination) -> crate::Result<BoxedTransport> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let script = self.script.clone();
        let seen = self.seen.clone();

        tokio::spawn(async move {
            let mut framed = Framed::new(server, MessageCodec::server());
            while let Some(Ok(message)) = framed.next().await {
                let Some(request) = message.into_request() else { break };
                seen.lock().push(request.clone());
                match script(&request) {
                    Action::Respond(response) => {
                        if framed.send(response).await.is_err() {
                            break;
                        }
                    }
                    Action::RespondAndClose(response) => {
                        let _ = framed.send(response).await;
                        break;
                    }
                    Action::Hang => std::future::pending::<()>().await,
                    Action::Close => break,
                }
            }
        });
        Ok(Box::new(client))
    }
}

fn client_for(connector: &Arc<ScriptedConnector>, config: ClientConfig) -> HttpClient {
    HttpClient::with_connector(config, connector.clone())
}

#[tokio::test]
async fn test_client_completes_and_pools_connection() {
    let connector = ScriptedConnector::new(|_| Action::Respond(Response::ok("hello")));
    let client = client_for(&connector, ClientConfig::default());

    let response = client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().to_bytes(), "hello");
    assert_eq!(client.pool().idle_count(), 1);

    let seen = connector.requests();
    assert_eq!(seen[0].header("host"), Some("example.com"));
    assert!(seen[0].header("user-agent").unwrap().starts_with("httpwire/"));

    client.send(Request::get("http://example.com/again").unwrap()).await.unwrap();
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_client_follows_redirect() {
    let connector = ScriptedConnector::new(|request| match request.uri().path() {
        "/old" => Action::Respond(redirect(StatusCode::FOUND, "/new")),
        _ => Action::Respond(Response::ok("moved here")),
    });
    let client = client_for(&connector, ClientConfig::default());

    let request = Request::builder()
        .method(Method::POST)
        .uri("http://example.com/old?x=1")
        .body("payload")
        .build()
        .unwrap();
    let response = client.send(request).await.unwrap();
    assert_eq!(response.body().to_bytes(), "moved here");

    let seen = connector.requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].method(), Method::POST);
    assert_eq!(seen[1].method(), Method::GET);
    assert_eq!(seen[1].target(), "/new");
    assert_eq!(seen[1].body(), &Body::Empty);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_client_delivers_fourth_challenge() {
    let connector = ScriptedConnector::new(|_| Action::Respond(challenge("Basic realm=\"r\"")));
    let config = ClientConfigBuilder::new().credentials("user", "pass").build();
    let client = client_for(&connector, config);

    let response = client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let seen = connector.requests();
    assert_eq!(seen.len(), 4);
    assert!(seen[0].header("authorization").is_none());
    for request in &seen[1..] {
        assert_eq!(request.header("authorization"), Some("Basic dXNlcjpwYXNz"));
    }
}

#[tokio::test]
async fn test_client_does_not_pool_closing_connection() {
    let connector = ScriptedConnector::new(|_| {
        Action::Respond(Response::builder(StatusCode::OK).header("connection", "close").body("bye").build())
    });
    let client = client_for(&connector, ClientConfig::default());

    let response = client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    assert_eq!(response.body().to_bytes(), "bye");
    assert_eq!(client.pool().idle_count(), 0);
}

#[tokio::test]
async fn test_client_replaces_stale_pooled_connection() {
    let connector = ScriptedConnector::new(|_| Action::RespondAndClose(Response::ok("once")));
    let client = client_for(&connector, ClientConfig::default());

    client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    let response = client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    assert_eq!(response.body().to_bytes(), "once");
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_client_does_not_resend_post_after_write() {
    let connector = ScriptedConnector::new(|request| {
        if request.method() == Method::POST {
            Action::Close
        } else {
            Action::Respond(Response::ok("ready"))
        }
    });
    let client = client_for(&connector, ClientConfig::default());

    client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    assert_eq!(client.pool().idle_count(), 1);

    let request = Request::builder()
        .method(Method::POST)
        .uri("http://example.com/orders")
        .body("item=1")
        .build()
        .unwrap();
    let result = client.send(request).await;
    assert!(matches!(result, Err(WireError::ConnectionClosed)));

    let seen = connector.requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].method(), Method::POST);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_client_resends_idempotent_request_after_close() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let connector = ScriptedConnector::new(move |_| match counter.fetch_add(1, Ordering::SeqCst) {
        1 => Action::Close,
        _ => Action::Respond(Response::ok("fresh")),
    });
    let client = client_for(&connector, ClientConfig::default());

    client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    let response = client.send(Request::get("http://example.com/").unwrap()).await.unwrap();
    assert_eq!(response.body().to_bytes(), "fresh");
    assert_eq!(served.load(Ordering::SeqCst), 3);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_client_follows_relative_redirect_with_absolute_query() {
    let connector = ScriptedConnector::new(|request| match request.uri().path() {
        "/start" => Action::Respond(redirect(StatusCode::FOUND, "/login?next=http://example.com/a")),
        _ => Action::Respond(Response::ok("login form")),
    });
    let client = client_for(&connector, ClientConfig::default());

    let response = client.send(Request::get("http://example.com/start").unwrap()).await.unwrap();
    assert_eq!(response.body().to_bytes(), "login form");
    assert_eq!(connector.requests()[1].uri().path(), "/login");
}

#[tokio::test]
async fn test_client_reports_closed_connection() {
    let connector = ScriptedConnector::new(|_| Action::Close);
    let client = client_for(&connector, ClientConfig::default());

    let result = client.send(Request::get("http://example.com/").unwrap()).await;
    assert!(matches!(result, Err(WireError::ConnectionClosed)));
    assert_eq!(client.pool().idle_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_read_timeout() {
    let connector = ScriptedConnector::new(|_| Action::Hang);
    let config = ClientConfigBuilder::new().read_timeout(Duration::from_secs(5)).build();
    let client = client_for(&connector, config);

    let result = client.send(Request::get("http://example.com/").unwrap()).await;
    assert!(matches!(result, Err(WireError::Timeout(_))));
    assert_eq!(client.pool().idle_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_request_timeout() {
    let connector = ScriptedConnector::new(|_| Action::Hang);
    let config = ClientConfigBuilder::new()
        .read_timeout(Duration::from_secs(600))
        .request_timeout(Duration::from_secs(2))
        .build();
    let client = client_for(&connector, config);

    match client.send(Request::get("http://example.com/").unwrap()).await {
        Err(WireError::Timeout(message)) => assert!(message.contains("request exceeded")),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_rejects_relative_uri() {
    let connector = ScriptedConnector::new(|_| Action::Respond(Response::ok("")));
    let client = client_for(&connector, ClientConfig::default());

    let request = Request::new(Method::GET, "/relative".parse().unwrap()).unwrap();
    assert!(matches!(client.send(request).await, Err(WireError::InvalidUri(_))));
    assert_eq!(connector.connects(), 0);
}
