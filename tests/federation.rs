/// Integration tests for a federation of in-process servers.
///
/// Each test starts real servers on loopback ports, joins them the way the
/// binary does (one configured remote per server) and talks to them with
/// line-based JSON test clients.
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use activitystream::server::config::Settings;
use activitystream::server::control::{Control, RunState};
use activitystream::server::listener::Listener;
use activitystream::server::registry::Credentials;

const SECRET: &str = "federation-secret";
const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    control: Arc<Control>,
    port: u16,
}

/// Start a server, optionally joining the server listening on `remote`.
async fn start_server(remote: Option<u16>, secret: &str) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let control = Control::new(Settings {
        local_hostname: "127.0.0.1".into(),
        local_port: port,
        remote_hostname: remote.map(|_| "127.0.0.1".to_owned()),
        remote_port: remote.unwrap_or_default(),
        secret: secret.into(),
        activity_interval: Duration::from_millis(100),
        registration_timeout: Duration::from_secs(2),
    });

    tokio::spawn(Listener::new(listener, Arc::clone(&control)).run());
    tokio::spawn(Arc::clone(&control).run_ticker());
    control.connect_remote().await.unwrap();

    TestServer { control, port }
}

/// Wait until `server` knows about `expected` peers.
async fn await_peers(server: &TestServer, expected: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while server.control.peers().await.len() < expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peers did not converge");
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, msg: Value) {
        let line = format!("{msg}\n");
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.send_bytes(line.as_bytes()).await;
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Next message, or `None` once the server closed the connection.
    async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a message")
            .ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn expect(&mut self, command: &str) -> Value {
        let msg = self.recv().await.unwrap_or_else(|| panic!("closed while waiting for {command}"));
        assert_eq!(msg["command"], command, "unexpected message: {msg}");
        msg
    }

    async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, None);
    }

    async fn register(&mut self, username: &str, secret: &str) -> Value {
        self.send(json!({"command": "REGISTER", "username": username, "secret": secret}))
            .await;
        self.recv().await.expect("no reply to REGISTER")
    }

    async fn login(&mut self, username: &str, secret: Option<&str>) -> Value {
        let mut msg = json!({"command": "LOGIN", "username": username});
        if let Some(secret) = secret {
            msg["secret"] = json!(secret);
        }
        self.send(msg).await;
        self.recv().await.expect("no reply to LOGIN")
    }
}

// ── Single server ───────────────────────────────────────────────────

#[tokio::test]
async fn lone_server_register_and_login() {
    let a = start_server(None, SECRET).await;

    let mut client = TestClient::connect(a.port).await;
    let reply = client.register("alice", "s1").await;
    assert_eq!(reply["command"], "REGISTER_SUCCESS");

    let reply = client.login("alice", Some("s1")).await;
    assert_eq!(reply["command"], "LOGIN_SUCCESS");
    assert_eq!(a.control.current_load(), 1);

    client.send(json!({"command": "LOGOUT"})).await;
    client.expect_closed().await;
}

#[tokio::test]
async fn duplicate_registration_fails_and_closes() {
    let a = start_server(None, SECRET).await;

    let mut first = TestClient::connect(a.port).await;
    assert_eq!(first.register("alice", "s1").await["command"], "REGISTER_SUCCESS");

    let mut second = TestClient::connect(a.port).await;
    assert_eq!(second.register("alice", "s2").await["command"], "REGISTER_FAILED");
    second.expect_closed().await;
}

#[tokio::test]
async fn login_with_wrong_secret_fails() {
    let a = start_server(None, SECRET).await;
    let mut reg = TestClient::connect(a.port).await;
    reg.register("alice", "s1").await;

    let mut client = TestClient::connect(a.port).await;
    assert_eq!(client.login("alice", Some("nope")).await["command"], "LOGIN_FAILED");
    client.expect_closed().await;
}

#[tokio::test]
async fn malformed_line_gets_invalid_message() {
    let a = start_server(None, SECRET).await;
    let mut client = TestClient::connect(a.port).await;

    client.send_raw("this is not json\n").await;

    client.expect("INVALID_MESSAGE").await;
    client.expect_closed().await;
}

#[tokio::test]
async fn invalid_utf8_gets_invalid_message() {
    let a = start_server(None, SECRET).await;
    let mut client = TestClient::connect(a.port).await;

    client.send_bytes(b"{\"command\":\"\xff\xfe\"}\n").await;

    client.expect("INVALID_MESSAGE").await;
    client.expect_closed().await;
}

#[tokio::test]
async fn unknown_command_gets_invalid_message() {
    let a = start_server(None, SECRET).await;
    let mut client = TestClient::connect(a.port).await;

    client.send(json!({"command": "SHOUT"})).await;

    let reply = client.expect("INVALID_MESSAGE").await;
    assert_eq!(reply["info"], "unknown command: SHOUT");
    client.expect_closed().await;
}

#[tokio::test]
async fn server_with_wrong_secret_is_rejected() {
    let a = start_server(None, SECRET).await;
    let b = start_server(Some(a.port), "wrong").await;

    tokio::time::timeout(TIMEOUT, async {
        while b.control.run_state() == RunState::Running {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("joining server did not fail");

    assert!(matches!(b.control.run_state(), RunState::Failed(_)));
    assert!(a.control.peers().await.is_empty());
}

// ── Federation ──────────────────────────────────────────────────────

#[tokio::test]
async fn registration_spans_two_servers() {
    let a = start_server(None, SECRET).await;
    let b = start_server(Some(a.port), SECRET).await;
    await_peers(&a, 1).await;
    await_peers(&b, 1).await;

    let mut client = TestClient::connect(b.port).await;
    assert_eq!(client.register("alice", "s1").await["command"], "REGISTER_SUCCESS");
    assert!(a.control.is_registered("alice").await);

    // Known everywhere: logging in at the other server works.
    let mut other = TestClient::connect(a.port).await;
    assert_eq!(other.login("alice", Some("s1")).await["command"], "LOGIN_SUCCESS");

    // And registering it again anywhere fails.
    let mut late = TestClient::connect(a.port).await;
    assert_eq!(late.register("alice", "s2").await["command"], "REGISTER_FAILED");
}

#[tokio::test]
async fn concurrent_registrations_have_one_winner() {
    let a = start_server(None, SECRET).await;
    let b = start_server(Some(a.port), SECRET).await;
    await_peers(&a, 1).await;
    await_peers(&b, 1).await;

    let mut at_a = TestClient::connect(a.port).await;
    let mut at_b = TestClient::connect(b.port).await;
    let (ra, rb) = tokio::join!(at_a.register("alice", "a"), at_b.register("alice", "b"));

    let outcomes = [ra["command"].clone(), rb["command"].clone()];
    let wins = outcomes
        .iter()
        .filter(|c| c.as_str() == Some("REGISTER_SUCCESS"))
        .count();
    assert_eq!(wins, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.iter().any(|c| c.as_str() == Some("REGISTER_FAILED")));

    // Both registries agree on the winning secret.
    let winner = if ra["command"] == "REGISTER_SUCCESS" { "a" } else { "b" };
    for server in [&a, &b] {
        let creds = server.control.check_credentials("alice", Some(winner)).await;
        assert_eq!(creds, Credentials::Valid);
    }
}

#[tokio::test]
async fn concurrent_registrations_across_a_chain_have_one_winner() {
    let a = start_server(None, SECRET).await;
    let b = start_server(Some(a.port), SECRET).await;
    let c = start_server(Some(b.port), SECRET).await;
    for server in [&a, &b, &c] {
        await_peers(server, 2).await;
    }

    // The two racers sit at either end; the middle server sees both rounds.
    for round in 0..10 {
        let username = format!("user{round}");
        let mut at_a = TestClient::connect(a.port).await;
        let mut at_c = TestClient::connect(c.port).await;
        let (ra, rc) = tokio::join!(at_a.register(&username, "a"), at_c.register(&username, "c"));

        let outcomes = [ra["command"].clone(), rc["command"].clone()];
        let wins = outcomes
            .iter()
            .filter(|o| o.as_str() == Some("REGISTER_SUCCESS"))
            .count();
        assert_eq!(wins, 1, "{username}: {outcomes:?}");

        let winner = if ra["command"] == "REGISTER_SUCCESS" { "a" } else { "c" };
        for server in [&a, &b, &c] {
            let creds = server.control.check_credentials(&username, Some(winner)).await;
            assert_eq!(creds, Credentials::Valid, "{username}: {outcomes:?}");
        }
    }
}

#[tokio::test]
async fn activity_reaches_clients_on_other_servers() {
    let a = start_server(None, SECRET).await;
    let b = start_server(Some(a.port), SECRET).await;
    await_peers(&a, 1).await;
    await_peers(&b, 1).await;

    let mut sender = TestClient::connect(a.port).await;
    sender.login("anonymous", None).await;
    let mut receiver = TestClient::connect(b.port).await;
    receiver.login("anonymous", None).await;

    sender
        .send(json!({
            "command": "ACTIVITY_MESSAGE",
            "username": "anonymous",
            "activity": {"text": "hello"}
        }))
        .await;

    let msg = receiver.expect("ACTIVITY_BROADCAST").await;
    assert_eq!(
        msg["activity"],
        json!({"text": "hello", "authenticated_user": "anonymous"})
    );
}

#[tokio::test]
async fn activity_crosses_a_chain_once() {
    let a = start_server(None, SECRET).await;
    let b = start_server(Some(a.port), SECRET).await;
    let c = start_server(Some(b.port), SECRET).await;
    for server in [&a, &b, &c] {
        await_peers(server, 2).await;
    }

    let mut at_a = TestClient::connect(a.port).await;
    at_a.login("anonymous", None).await;
    let mut at_c = TestClient::connect(c.port).await;
    at_c.login("anonymous", None).await;

    for n in 0..2 {
        at_c.send(json!({
            "command": "ACTIVITY_MESSAGE",
            "username": "anonymous",
            "activity": {"n": n}
        }))
        .await;
    }

    // Each activity arrives exactly once, in order.
    assert_eq!(at_a.expect("ACTIVITY_BROADCAST").await["activity"]["n"], 0);
    assert_eq!(at_a.expect("ACTIVITY_BROADCAST").await["activity"]["n"], 1);
}

#[tokio::test]
async fn busy_server_redirects_to_idle_peer() {
    let a = start_server(None, SECRET).await;
    let b = start_server(Some(a.port), SECRET).await;
    await_peers(&a, 1).await;

    let mut first = TestClient::connect(a.port).await;
    assert_eq!(first.login("anonymous", None).await["command"], "LOGIN_SUCCESS");

    // Load 2 against an idle peer: the gap reaches the threshold.
    let mut second = TestClient::connect(a.port).await;
    assert_eq!(second.login("anonymous", None).await["command"], "LOGIN_SUCCESS");
    let redirect = second.expect("REDIRECT").await;
    assert_eq!(redirect["hostname"], "127.0.0.1");
    assert_eq!(redirect["port"], b.port);
    second.expect_closed().await;
}
