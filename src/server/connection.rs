/// Per-socket protocol state machine.
///
/// A connection starts unclassified and becomes a server (after
/// `AUTHENTICATE`) or a client (after `LOGIN` or `REGISTER`). Messages that
/// only touch this connection are handled here; anything with a cross-
/// connection effect is delegated to [`Control::process`].
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::codec::{CodecError, StreamCodec};
use super::control::Control;
use super::message::Message;
use super::registry::Credentials;

/// Identifies a live connection inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by our listener; the peer must identify itself.
    Inbound,
    /// Dialed by us to a configured peer server.
    Outbound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Kind {
    #[default]
    Unclassified,
    Server,
    Client,
}

/// Session state owned by one connection. The coordinator only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub kind: Kind,
    /// Server handshake completed.
    pub authenticated: bool,
    /// Client login completed.
    pub logged_in: bool,
    /// Client identity once logged in.
    pub username: Option<String>,
}

impl Session {
    fn for_origin(origin: Origin) -> Self {
        match origin {
            Origin::Inbound => Self::default(),
            // The remote authenticates us; from our side it is a trusted server.
            Origin::Outbound => Self {
                kind: Kind::Server,
                authenticated: true,
                ..Self::default()
            },
        }
    }

    pub fn is_server(&self) -> bool {
        self.kind == Kind::Server
    }

    pub fn is_client(&self) -> bool {
        self.kind == Kind::Client
    }

    pub fn is_authenticated_server(&self) -> bool {
        self.is_server() && self.authenticated
    }

    pub fn is_logged_in_client(&self) -> bool {
        self.is_client() && self.logged_in
    }

    /// Authenticated server or logged-in client: eligible for broadcasts.
    pub fn is_active(&self) -> bool {
        self.is_authenticated_server() || self.is_logged_in_client()
    }
}

/// Work queued for a connection's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(Message),
    /// Flush what was queued before this and close the socket.
    Close,
}

/// Whether a connection keeps running after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// The coordinator's non-owning view of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
    session: watch::Receiver<Session>,
}

impl ConnectionHandle {
    /// Queue a message. Returns false once the connection has closed.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(Outbound::Message(msg)).is_ok()
    }

    /// Ask the connection to flush its queue and close.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn session(&self) -> watch::Ref<'_, Session> {
        self.session.borrow()
    }
}

/// One protocol connection, driven by its own task.
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    origin: Origin,
    session: Session,
    published: watch::Sender<Session>,
    tx: mpsc::UnboundedSender<Outbound>,
    control: Arc<Control>,
}

impl Connection {
    /// Build a connection and the handle the coordinator keeps for it.
    pub(super) fn new(
        id: ConnectionId,
        addr: SocketAddr,
        origin: Origin,
        control: Arc<Control>,
    ) -> (Self, ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::for_origin(origin);
        let (published, watched) = watch::channel(session.clone());

        let handle = ConnectionHandle {
            id,
            addr,
            tx: tx.clone(),
            session: watched,
        };
        let conn = Self {
            id,
            addr,
            origin,
            session,
            published,
            tx,
            control,
        };
        (conn, handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Queue a message on this connection. Never blocks.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(Outbound::Message(msg)).is_ok()
    }

    /// Handle one decoded message from the peer.
    pub async fn accept_message(&mut self, msg: Message) -> Flow {
        match msg {
            Message::Authenticate { secret } => self.authenticate(&secret),

            Message::Login { username, secret } => self.login(username, secret).await,

            Message::Logout => {
                info!(conn = %self.id, username = ?self.session.username, "client logged out");
                Flow::Close
            }

            Message::ActivityMessage {
                ref username,
                ref secret,
                ..
            } => {
                if !self.session.is_logged_in_client() {
                    return self.terminate(
                        Message::authentication_fail("no user logged in"),
                        "ACTIVITY_MESSAGE before login",
                    );
                }
                if self.session.username.as_deref() != Some(username.as_str()) {
                    return self.terminate(
                        Message::authentication_fail("username does not match logged in user"),
                        "ACTIVITY_MESSAGE username mismatch",
                    );
                }
                let creds = self.control.check_credentials(username, secret.as_deref()).await;
                if creds != Credentials::Valid {
                    return self.terminate(
                        Message::authentication_fail(creds.describe()),
                        "ACTIVITY_MESSAGE rejected",
                    );
                }
                self.control.process(self.id, msg).await
            }

            Message::ServerAnnounce { .. }
            | Message::ActivityBroadcast { .. }
            | Message::LockRequest { .. }
            | Message::LockAllowed { .. }
            | Message::LockDenied { .. } => {
                if !self.session.is_authenticated_server() {
                    let reason = format!("{} from unauthenticated server", msg.command());
                    return self.terminate(Message::invalid("unauthenticated server"), &reason);
                }
                self.control.process(self.id, msg).await
            }

            Message::Register { .. } => {
                let flow = self.control.process(self.id, msg).await;
                if flow == Flow::Continue && self.session.kind == Kind::Unclassified {
                    self.session.kind = Kind::Client;
                    self.publish();
                }
                flow
            }

            Message::AuthenticationFail { info } => {
                error!(conn = %self.id, addr = %self.addr, "authentication failed: {info}");
                if self.origin == Origin::Outbound {
                    self.control
                        .abort(format!("remote server {} rejected our secret: {info}", self.addr));
                }
                Flow::Close
            }

            Message::InvalidMessage { info } => {
                warn!(conn = %self.id, addr = %self.addr, "peer reported invalid message: {info}");
                Flow::Close
            }

            other => {
                let reason = format!("unexpected command: {}", other.command());
                self.terminate(Message::invalid(reason.clone()), &reason)
            }
        }
    }

    /// Reply to a line that could not be decoded, then close.
    pub fn reject(&self, err: &CodecError) -> Flow {
        match err {
            CodecError::Parse(parse) => self.terminate(parse.reply(), &parse.to_string()),
            other => self.terminate(Message::invalid(other.to_string()), &other.to_string()),
        }
    }

    fn authenticate(&mut self, secret: &str) -> Flow {
        if secret != self.control.settings().secret {
            return self.terminate(Message::authentication_fail("wrong secret"), "AUTHENTICATE with wrong secret");
        }
        if self.session.is_authenticated_server() {
            return self.terminate(Message::invalid("already authenticated"), "repeated AUTHENTICATE");
        }
        if self.session.is_client() {
            return self.terminate(
                Message::invalid("client connections cannot authenticate"),
                "AUTHENTICATE from client",
            );
        }

        self.session.kind = Kind::Server;
        self.session.authenticated = true;
        self.publish();
        info!(conn = %self.id, addr = %self.addr, "server authenticated");
        Flow::Continue
    }

    async fn login(&mut self, username: String, secret: Option<String>) -> Flow {
        if self.session.is_server() {
            return self.terminate(Message::invalid("server connections cannot log in"), "LOGIN from server");
        }
        if self.session.logged_in {
            return self.terminate(Message::login_failed("already logged in"), "repeated LOGIN");
        }

        let creds = self.control.check_credentials(&username, secret.as_deref()).await;
        if creds != Credentials::Valid {
            return self.terminate(Message::login_failed(creds.describe()), "LOGIN rejected");
        }

        self.session.kind = Kind::Client;
        self.session.logged_in = true;
        self.session.username = Some(username.clone());
        self.publish();

        let load = self.control.client_logged_in();
        self.send(Message::login_success(format!("logged in as user {username}")));
        info!(conn = %self.id, username, load, "client logged in");

        // Evaluated after accounting so this client counts towards our load.
        if let Some(peer) = self.control.redirect_target(load).await {
            info!(conn = %self.id, username, to = %format!("{}:{}", peer.hostname, peer.port), "redirecting client");
            self.send(Message::Redirect {
                hostname: peer.hostname,
                port: peer.port,
            });
            return Flow::Close;
        }
        Flow::Continue
    }

    /// Queue `reply`, log why, and signal close.
    fn terminate(&self, reply: Message, reason: &str) -> Flow {
        warn!(conn = %self.id, addr = %self.addr, "closing connection: {reason}");
        self.send(reply);
        Flow::Close
    }

    fn publish(&self) {
        self.published.send_replace(self.session.clone());
    }

    /// Drive the socket until either side closes.
    pub async fn run(mut self, socket: TcpStream, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        let mut framed = Framed::new(socket, StreamCodec::default());

        loop {
            tokio::select! {
                // Incoming message from the peer.
                frame = framed.next() => {
                    let flow = match frame {
                        Some(Ok(msg)) => {
                            debug!(conn = %self.id, command = msg.command(), "received");
                            self.accept_message(msg).await
                        }
                        Some(Err(CodecError::Io(e))) => {
                            debug!(conn = %self.id, "read error: {e}");
                            Flow::Close
                        }
                        Some(Err(e)) => self.reject(&e),
                        None => Flow::Close, // Connection closed.
                    };
                    if flow == Flow::Close {
                        break;
                    }
                }

                // Outgoing message queued by this or another task.
                Some(out) = rx.recv() => match out {
                    Outbound::Message(msg) => {
                        if let Err(e) = framed.send(msg).await {
                            debug!(conn = %self.id, "write error: {e}");
                            break;
                        }
                    }
                    Outbound::Close => break,
                },
            }
        }

        // Flush whatever is still queued; extra close requests are no-ops.
        rx.close();
        while let Ok(item) = rx.try_recv() {
            let Outbound::Message(msg) = item else {
                continue;
            };
            if framed.send(msg).await.is_err() {
                break;
            }
        }

        drop(framed);
        self.close().await;
    }

    /// Remove this connection from the coordinator.
    pub async fn close(self) {
        info!(conn = %self.id, addr = %self.addr, "connection closed");
        self.control.connection_closed(self.id).await;
    }
}
