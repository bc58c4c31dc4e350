//! User registry and distributed registration tracking.
//!
//! The [`UserRegistry`] is this server's view of the federation-wide
//! username namespace. The [`RegistrationTracker`] holds the lock rounds this
//! server started: one [`PendingRegistration`] per username, counting down
//! the `LOCK_ALLOWED` replies still required from peers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::connection::ConnectionId;
use super::message::ANONYMOUS;

/// Outcome of checking a username/secret pair against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials {
    Valid,
    UnknownUser,
    WrongSecret,
}

impl Credentials {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Valid => "valid credentials",
            Self::UnknownUser => "user not registered",
            Self::WrongSecret => "wrong secret",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UserRecord {
    secret: String,
    /// Set while the entry is only held on behalf of another server's lock
    /// round; cleared once the hold settles or the name is registered here.
    held_since: Option<Instant>,
}

/// Username → secret. Usernames are compared verbatim.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<String, UserRecord>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn secret(&self, username: &str) -> Option<&str> {
        self.users.get(username).map(|r| r.secret.as_str())
    }

    /// Register `username` for good.
    pub fn insert(&mut self, username: &str, secret: &str) {
        self.users.insert(
            username.to_owned(),
            UserRecord {
                secret: secret.to_owned(),
                held_since: None,
            },
        );
    }

    /// Hold `username` for a peer's lock round, replacing any earlier hold.
    pub fn hold(&mut self, username: &str, secret: &str, now: Instant) {
        self.users.insert(
            username.to_owned(),
            UserRecord {
                secret: secret.to_owned(),
                held_since: Some(now),
            },
        );
    }

    pub fn is_held(&self, username: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|r| r.held_since.is_some())
    }

    /// Whether a peer's `LOCK_REQUEST{username, secret}` may be allowed.
    ///
    /// Unknown names are free. A held name yields to a strictly lower secret,
    /// the same rule [`RegistrationTracker::contends`] applies to our own
    /// rounds. A registered name is never given up.
    pub fn admits(&self, username: &str, secret: &str) -> bool {
        match self.users.get(username) {
            None => true,
            Some(UserRecord {
                held_since: Some(_),
                secret: held,
            }) => secret < held.as_str(),
            Some(_) => false,
        }
    }

    /// Turn holds older than `window` into registrations.
    ///
    /// By then the round that asked for the hold has either completed or
    /// been rolled back with `LOCK_DENIED`.
    pub fn settle(&mut self, now: Instant, window: Duration) -> usize {
        let mut settled = 0;
        for record in self.users.values_mut() {
            if record
                .held_since
                .is_some_and(|since| now.saturating_duration_since(since) > window)
            {
                record.held_since = None;
                settled += 1;
            }
        }
        settled
    }

    /// Remove `username` only if it is stored with exactly `secret`.
    pub fn remove_matching(&mut self, username: &str, secret: &str) -> bool {
        if self.secret(username) == Some(secret) {
            self.users.remove(username);
            true
        } else {
            false
        }
    }

    /// Check a login or activity credential. The anonymous user always passes.
    pub fn check(&self, username: &str, secret: Option<&str>) -> Credentials {
        if username == ANONYMOUS {
            return Credentials::Valid;
        }
        match self.secret(username) {
            None => Credentials::UnknownUser,
            Some(stored) if Some(stored) == secret => Credentials::Valid,
            Some(_) => Credentials::WrongSecret,
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// A lock round this server started on behalf of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRegistration {
    pub username: String,
    pub secret: String,
    /// The client connection that sent `REGISTER`.
    pub origin: Option<ConnectionId>,
    /// `LOCK_ALLOWED` replies still required.
    pub remaining: usize,
    pub created: Instant,
}

/// Result of applying a `LOCK_ALLOWED` to the tracker.
#[derive(Debug, PartialEq, Eq)]
pub enum Allowance {
    /// No matching lock round is pending here.
    NotPending,
    /// Still waiting for this many more confirmations.
    Waiting(usize),
    /// Every peer allowed; the round is finished and removed.
    Complete(PendingRegistration),
}

#[derive(Debug, Default)]
pub struct RegistrationTracker {
    pending: HashMap<String, PendingRegistration>,
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a lock round requiring `required` confirmations.
    /// Returns false if a round for `username` is already pending.
    pub fn begin(
        &mut self,
        username: &str,
        secret: &str,
        origin: Option<ConnectionId>,
        required: usize,
        now: Instant,
    ) -> bool {
        if self.pending.contains_key(username) {
            return false;
        }
        self.pending.insert(
            username.to_owned(),
            PendingRegistration {
                username: username.to_owned(),
                secret: secret.to_owned(),
                origin,
                remaining: required,
                created: now,
            },
        );
        true
    }

    pub fn get(&self, username: &str) -> Option<&PendingRegistration> {
        self.pending.get(username)
    }

    pub fn is_pending(&self, username: &str) -> bool {
        self.pending.contains_key(username)
    }

    /// Whether a peer's `LOCK_REQUEST{username, secret}` collides with a
    /// round we are running ourselves.
    ///
    /// Two rounds for the same name resolve in favour of the lower secret:
    /// a request with a strictly lower secret than ours is allowed, anything
    /// else is denied. Both servers apply the same rule, so at most one round
    /// survives.
    pub fn contends(&self, username: &str, secret: &str) -> bool {
        self.pending
            .get(username)
            .is_some_and(|ours| secret >= ours.secret.as_str())
    }

    /// Count one `LOCK_ALLOWED{username, secret}`.
    pub fn allow(&mut self, username: &str, secret: &str) -> Allowance {
        let Some(pending) = self.pending.get_mut(username) else {
            return Allowance::NotPending;
        };
        if pending.secret != secret {
            return Allowance::NotPending;
        }

        pending.remaining = pending.remaining.saturating_sub(1);
        if pending.remaining > 0 {
            return Allowance::Waiting(pending.remaining);
        }
        match self.pending.remove(username) {
            Some(done) => Allowance::Complete(done),
            None => Allowance::NotPending,
        }
    }

    /// Abort the round for `username` if it was requested with `secret`.
    pub fn deny(&mut self, username: &str, secret: &str) -> Option<PendingRegistration> {
        if self.pending.get(username)?.secret != secret {
            return None;
        }
        self.pending.remove(username)
    }

    /// Drop every round started more than `window` before `now`.
    pub fn expire(&mut self, now: Instant, window: Duration) -> Vec<PendingRegistration> {
        let stale: Vec<String> = self
            .pending
            .values()
            .filter(|p| now.saturating_duration_since(p.created) > window)
            .map(|p| p.username.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|username| self.pending.remove(&username))
            .collect()
    }

    /// Forget every round owned by a connection that has gone away.
    pub fn abandon_origin(&mut self, origin: ConnectionId) -> Vec<PendingRegistration> {
        let owned: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.origin == Some(origin))
            .map(|p| p.username.clone())
            .collect();

        owned
            .into_iter()
            .filter_map(|username| self.pending.remove(&username))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
