//! The per-process coordinator.
//!
//! [`Control`] owns everything shared between connections: the connection
//! table, the peer directory, the user registry and the lock rounds in
//! flight. All mutation happens under one async mutex, so every protocol
//! action is atomic with respect to every other.
//!
//! Connections hand messages with cross-connection effects to
//! [`Control::process`]; fan-out to other connections is done by queueing on
//! their handles, which never blocks.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::config::Settings;
use super::connection::{Connection, ConnectionHandle, ConnectionId, Flow, Origin, Outbound, Session};
use super::directory::{PeerDirectory, PeerEntry};
use super::error::ServerError;
use super::message::{Activity, Message, ANONYMOUS, AUTHENTICATED_USER};
use super::registry::{
    Allowance, Credentials, PendingRegistration, RegistrationTracker, UserRegistry,
};

/// Lifecycle of the whole server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Orderly shutdown requested.
    Stopping,
    /// A fatal condition was detected; the process should exit.
    Failed(String),
}

/// How many connections of each kind a broadcast reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    pub servers: usize,
    pub clients: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    /// Authenticated servers only.
    Servers,
    /// Authenticated servers and logged-in clients.
    Everyone,
}

#[derive(Debug, Default)]
struct ControlState {
    connections: BTreeMap<ConnectionId, ConnectionHandle>,
    peers: PeerDirectory,
    users: UserRegistry,
    registrations: RegistrationTracker,
}

impl ControlState {
    /// Queue `msg` on every eligible connection except `except`.
    fn broadcast(&self, except: Option<ConnectionId>, audience: Audience, msg: &Message) -> Fanout {
        let mut fanout = Fanout::default();
        for (id, handle) in &self.connections {
            if Some(*id) == except {
                continue;
            }
            let session = handle.session();
            let eligible = match audience {
                Audience::Servers => session.is_authenticated_server(),
                Audience::Everyone => session.is_active(),
            };
            if !eligible || !handle.send(msg.clone()) {
                continue;
            }
            if session.is_server() {
                fanout.servers += 1;
            } else {
                fanout.clients += 1;
            }
        }
        fanout
    }

    fn send_to(&self, id: ConnectionId, msg: Message) -> bool {
        self.connections.get(&id).is_some_and(|h| h.send(msg))
    }

    /// Send a final reply to `id` and ask it to close.
    fn fail_connection(&self, id: ConnectionId, msg: Message) {
        if let Some(handle) = self.connections.get(&id) {
            handle.send(msg);
            handle.close();
        }
    }

    fn logged_in_clients(&self) -> usize {
        self.connections
            .values()
            .filter(|h| h.session().is_logged_in_client())
            .count()
    }
}

/// Coordinator shared by the listener, the ticker and every connection.
pub struct Control {
    server_id: String,
    settings: Settings,
    state: Mutex<ControlState>,
    /// Logged-in clients; read on the login path without taking the lock.
    load: AtomicU32,
    next_id: AtomicU64,
    run_state: watch::Sender<RunState>,
}

impl Control {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (run_state, _) = watch::channel(RunState::Running);
        let server_id = format!("{:032x}", rand::random::<u128>());
        info!(server_id, "control initialised");

        Arc::new(Self {
            server_id,
            settings,
            state: Mutex::new(ControlState::default()),
            load: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            run_state,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Register a new connection and return it with its outbound queue.
    ///
    /// The caller drives the connection, normally via [`Connection::run`].
    pub async fn attach(
        self: &Arc<Self>,
        addr: SocketAddr,
        origin: Origin,
    ) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (conn, handle, rx) = Connection::new(id, addr, origin, Arc::clone(self));
        self.state.lock().await.connections.insert(id, handle);
        debug!(conn = %id, %addr, ?origin, "connection attached");
        (conn, rx)
    }

    /// Take over an accepted socket.
    pub async fn incoming(self: &Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let (conn, rx) = self.attach(addr, Origin::Inbound).await;
        info!(conn = %conn.id(), %addr, "incoming connection");
        tokio::spawn(conn.run(socket, rx));
    }

    /// Dial a peer server and authenticate to it.
    pub async fn connect(self: &Arc<Self>, hostname: &str, port: u16) -> Result<ConnectionId, ServerError> {
        let addr = format!("{hostname}:{port}");
        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|source| ServerError::Connect { addr: addr.clone(), source })?;
        let peer = socket.peer_addr()?;

        let (conn, rx) = self.attach(peer, Origin::Outbound).await;
        let id = conn.id();
        conn.send(Message::Authenticate {
            secret: self.settings.secret.clone(),
        });
        tokio::spawn(conn.run(socket, rx));

        info!(conn = %id, %addr, "connected to remote server");
        Ok(id)
    }

    /// Dial the configured remote server, if any.
    pub async fn connect_remote(self: &Arc<Self>) -> Result<Option<ConnectionId>, ServerError> {
        let Some(hostname) = self.settings.remote_hostname.clone() else {
            return Ok(None);
        };
        let port = self.settings.remote_port;
        if self.settings.is_self(&hostname, port) {
            return Err(ServerError::SelfConnect {
                addr: format!("{hostname}:{port}"),
            });
        }
        self.connect(&hostname, port).await.map(Some)
    }

    /// Forget a connection, releasing its load and any lock round it owns.
    ///
    /// Idempotent: a second call for the same id does nothing.
    pub async fn connection_closed(&self, id: ConnectionId) {
        let mut st = self.state.lock().await;
        let Some(handle) = st.connections.remove(&id) else {
            return;
        };

        if handle.session().is_logged_in_client() {
            self.load.fetch_sub(1, Ordering::SeqCst);
        }

        for pending in st.registrations.abandon_origin(id) {
            info!(username = %pending.username, "registering client went away");
            Self::roll_back(&st, &pending);
        }
        debug!(conn = %id, remaining = st.connections.len(), "connection detached");
    }

    // ── Login support ────────────────────────────────────────────

    pub async fn check_credentials(&self, username: &str, secret: Option<&str>) -> Credentials {
        self.state.lock().await.users.check(username, secret)
    }

    /// Count a newly logged-in client. Returns the new load.
    pub fn client_logged_in(&self) -> u32 {
        self.load.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_load(&self) -> u32 {
        self.load.load(Ordering::SeqCst)
    }

    /// The peer a client should be sent to at `load`, if any.
    pub async fn redirect_target(&self, load: u32) -> Option<PeerEntry> {
        self.state.lock().await.peers.redirect_target(load).cloned()
    }

    // ── Message processing ───────────────────────────────────────

    /// Apply a message with cross-connection effects, received on `from`.
    pub async fn process(&self, from: ConnectionId, msg: Message) -> Flow {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let Some(session) = st.connections.get(&from).map(|h| h.session().clone()) else {
            return Flow::Close;
        };

        match &msg {
            Message::ActivityMessage { activity, .. } => {
                Self::on_activity_message(st, from, &session, activity.clone())
            }
            Message::ActivityBroadcast { .. } => {
                if !session.is_authenticated_server() {
                    return Self::reject(st, from, "unauthenticated server");
                }
                let fanout = st.broadcast(Some(from), Audience::Everyone, &msg);
                debug!(conn = %from, servers = fanout.servers, clients = fanout.clients, "activity relayed");
                Flow::Continue
            }
            Message::ServerAnnounce { id, load, hostname, port } => {
                if !session.is_authenticated_server() {
                    return Self::reject(st, from, "unauthenticated server");
                }
                self.on_server_announce(st, from, &msg, id, *load, hostname, *port)
            }
            Message::Register { username, secret } => {
                Self::on_register(st, from, &session, username, secret)
            }
            Message::LockRequest { username, secret } => {
                if !session.is_authenticated_server() {
                    return Self::reject(st, from, "unauthenticated server");
                }
                Self::on_lock_request(st, from, &msg, username, secret)
            }
            Message::LockDenied { username, secret } => {
                if !session.is_authenticated_server() {
                    return Self::reject(st, from, "unauthenticated server");
                }
                Self::on_lock_denied(st, from, &msg, username, secret)
            }
            Message::LockAllowed { username, secret } => {
                if !session.is_authenticated_server() {
                    return Self::reject(st, from, "unauthenticated server");
                }
                Self::on_lock_allowed(st, from, &msg, username, secret)
            }
            other => {
                let info = format!("unknown command: {}", other.command());
                Self::reject(st, from, &info)
            }
        }
    }

    fn reject(st: &ControlState, from: ConnectionId, info: &str) -> Flow {
        warn!(conn = %from, "rejecting message: {info}");
        st.send_to(from, Message::invalid(info));
        Flow::Close
    }

    fn refuse(st: &ControlState, from: ConnectionId, info: String) -> Flow {
        warn!(conn = %from, "register refused: {info}");
        st.send_to(from, Message::register_failed(info));
        Flow::Close
    }

    fn on_activity_message(
        st: &ControlState,
        from: ConnectionId,
        session: &Session,
        mut activity: Activity,
    ) -> Flow {
        let Some(username) = session.username.clone() else {
            return Self::reject(st, from, "no user logged in");
        };
        activity.insert(AUTHENTICATED_USER.to_owned(), Value::String(username.clone()));

        let fanout = st.broadcast(Some(from), Audience::Everyone, &Message::ActivityBroadcast { activity });
        info!(
            conn = %from,
            username,
            servers = fanout.servers,
            clients = fanout.clients,
            "activity broadcast"
        );
        Flow::Continue
    }

    #[allow(clippy::too_many_arguments)]
    fn on_server_announce(
        &self,
        st: &mut ControlState,
        from: ConnectionId,
        msg: &Message,
        id: &str,
        load: u32,
        hostname: &str,
        port: u16,
    ) -> Flow {
        // Our own announce looping back through the mesh.
        if id == self.server_id {
            return Flow::Continue;
        }

        if st.peers.upsert(id, hostname, port, load) {
            info!(peer = id, hostname, port, load, peers = st.peers.len(), "discovered server");
        } else {
            debug!(peer = id, load, "server announce");
        }

        st.broadcast(Some(from), Audience::Servers, msg);
        Flow::Continue
    }

    fn on_register(
        st: &mut ControlState,
        from: ConnectionId,
        session: &Session,
        username: &str,
        secret: &str,
    ) -> Flow {
        if st.users.contains(username) {
            return Self::refuse(st, from, format!("{username} is already registered with the system"));
        }
        if session.is_server() {
            return Self::reject(st, from, "servers cannot register users");
        }
        if session.logged_in {
            return Self::reject(st, from, "already logged in");
        }
        if username == ANONYMOUS {
            return Self::refuse(st, from, format!("{username} is a reserved username"));
        }
        if st.registrations.is_pending(username) {
            return Self::refuse(st, from, format!("registration for {username} is already in progress"));
        }

        let required = st.peers.len();
        if required == 0 {
            st.users.insert(username, secret);
            st.send_to(from, Message::register_success(format!("register success for {username}")));
            info!(conn = %from, username, "registered user");
            return Flow::Continue;
        }

        st.registrations
            .begin(username, secret, Some(from), required, Instant::now());
        let request = Message::LockRequest {
            username: username.to_owned(),
            secret: secret.to_owned(),
        };
        let fanout = st.broadcast(None, Audience::Servers, &request);
        info!(conn = %from, username, required, sent = fanout.servers, "lock round started");
        Flow::Continue
    }

    fn on_lock_request(
        st: &mut ControlState,
        from: ConnectionId,
        msg: &Message,
        username: &str,
        secret: &str,
    ) -> Flow {
        st.broadcast(Some(from), Audience::Servers, msg);

        // Competing rounds, whether ours or held for another server, resolve
        // towards the lowest secret so that exactly one of them can finish.
        let admitted = st.users.admits(username, secret);
        let contended = st.registrations.contends(username, secret);
        let reply = if !admitted || contended {
            info!(username, admitted, contended, "denying lock");
            Message::LockDenied {
                username: username.to_owned(),
                secret: secret.to_owned(),
            }
        } else {
            // A later LOCK_DENIED with this secret undoes the hold.
            st.users.hold(username, secret, Instant::now());
            debug!(username, "allowing lock");
            Message::LockAllowed {
                username: username.to_owned(),
                secret: secret.to_owned(),
            }
        };
        st.broadcast(None, Audience::Servers, &reply);
        Flow::Continue
    }

    fn on_lock_denied(
        st: &mut ControlState,
        from: ConnectionId,
        msg: &Message,
        username: &str,
        secret: &str,
    ) -> Flow {
        if st.users.remove_matching(username, secret) {
            debug!(username, "tentative registration rolled back");
        }
        st.broadcast(Some(from), Audience::Servers, msg);

        if let Some(pending) = st.registrations.deny(username, secret) {
            info!(username, "lock denied, registration failed");
            if let Some(origin) = pending.origin {
                st.fail_connection(
                    origin,
                    Message::register_failed(format!("{username} is already registered with the system")),
                );
            }
        }
        Flow::Continue
    }

    fn on_lock_allowed(
        st: &mut ControlState,
        from: ConnectionId,
        msg: &Message,
        username: &str,
        secret: &str,
    ) -> Flow {
        st.broadcast(Some(from), Audience::Servers, msg);

        match st.registrations.allow(username, secret) {
            Allowance::NotPending => {}
            Allowance::Waiting(remaining) => debug!(username, remaining, "lock allowed"),
            Allowance::Complete(pending) => {
                st.users.insert(&pending.username, &pending.secret);
                info!(username, "registered user");
                if let Some(origin) = pending.origin {
                    st.send_to(
                        origin,
                        Message::register_success(format!("register success for {username}")),
                    );
                }
            }
        }
        Flow::Continue
    }

    /// Tell every peer to drop a tentative registration we started.
    fn roll_back(st: &ControlState, pending: &PendingRegistration) {
        st.broadcast(
            None,
            Audience::Servers,
            &Message::LockDenied {
                username: pending.username.clone(),
                secret: pending.secret.clone(),
            },
        );
    }

    // ── Periodic work ────────────────────────────────────────────

    /// Announce ourselves to every peer, expire stalled lock rounds and
    /// settle holds whose rounds must have finished.
    pub async fn tick(&self) -> Fanout {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;

        let load = u32::try_from(st.logged_in_clients()).unwrap_or(u32::MAX);
        let announce = Message::ServerAnnounce {
            id: self.server_id.clone(),
            load,
            hostname: self.settings.local_hostname.clone(),
            port: self.settings.local_port,
        };
        let fanout = st.broadcast(None, Audience::Servers, &announce);
        debug!(load, servers = fanout.servers, "server announce sent");

        for pending in st
            .registrations
            .expire(Instant::now(), self.settings.registration_timeout)
        {
            warn!(username = %pending.username, "registration timed out");
            Self::roll_back(st, &pending);
            if let Some(origin) = pending.origin {
                st.fail_connection(origin, Message::register_failed("registration timed out"));
            }
        }

        // Twice the window leaves room for the originator's own sweep and
        // its rollback to reach us.
        let settled = st
            .users
            .settle(Instant::now(), self.settings.registration_timeout * 2);
        if settled > 0 {
            debug!(settled, "lock holds settled");
        }
        fanout
    }

    /// Run [`tick`](Self::tick) every activity interval until shutdown.
    pub async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.activity_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut state = self.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = wait_until_stopped(&mut state) => {
                    debug!("ticker stopping");
                    return;
                }
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.run_state.subscribe()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state.borrow().clone()
    }

    /// Record a fatal condition. Whoever waits on the run state exits.
    pub fn abort(&self, reason: String) {
        error!("aborting: {reason}");
        self.run_state.send_replace(RunState::Failed(reason));
    }

    /// Stop background tasks and close every connection.
    pub async fn shutdown(&self) {
        self.run_state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Stopping;
                true
            } else {
                false
            }
        });

        let st = self.state.lock().await;
        info!(connections = st.connections.len(), "closing all connections");
        for handle in st.connections.values() {
            handle.close();
        }
    }

    // ── Introspection ────────────────────────────────────────────

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn peers(&self) -> Vec<PeerEntry> {
        self.state.lock().await.peers.iter().cloned().collect()
    }

    pub async fn is_registered(&self, username: &str) -> bool {
        self.state.lock().await.users.contains(username)
    }

    pub async fn pending_registrations(&self) -> usize {
        self.state.lock().await.registrations.len()
    }
}

/// Resolve once the run state leaves [`RunState::Running`].
pub async fn wait_until_stopped(state: &mut watch::Receiver<RunState>) -> RunState {
    loop {
        let current = state.borrow_and_update().clone();
        if current != RunState::Running {
            return current;
        }
        if state.changed().await.is_err() {
            return RunState::Stopping;
        }
    }
}
