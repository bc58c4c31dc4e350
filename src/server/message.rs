/// Activity stream protocol messages.
///
/// Every message on the wire is a single JSON object with a mandatory
/// `command` field naming the variant; the remaining fields depend on the
/// command. Decoding happens once, at the connection boundary, into the
/// closed [`Message`] enum so that dispatch is an exhaustive `match`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Username that is exempt from secret checks.
pub const ANONYMOUS: &str = "anonymous";

/// The JSON object carried by activity messages and broadcasts.
pub type Activity = serde_json::Map<String, Value>;

/// Key injected into an activity object naming the user who sent it.
pub const AUTHENTICATED_USER: &str = "authenticated_user";

/// Every command name the protocol defines.
const COMMANDS: &[&str] = &[
    "AUTHENTICATE",
    "AUTHENTICATION_FAIL",
    "INVALID_MESSAGE",
    "LOGIN",
    "LOGIN_SUCCESS",
    "LOGIN_FAILED",
    "REDIRECT",
    "LOGOUT",
    "ACTIVITY_MESSAGE",
    "ACTIVITY_BROADCAST",
    "SERVER_ANNOUNCE",
    "REGISTER",
    "REGISTER_SUCCESS",
    "REGISTER_FAILED",
    "LOCK_REQUEST",
    "LOCK_ALLOWED",
    "LOCK_DENIED",
];

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Server-to-server handshake carrying the federation secret.
    Authenticate { secret: String },
    AuthenticationFail { info: String },
    InvalidMessage { info: String },
    Login {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    LoginSuccess { info: String },
    LoginFailed { info: String },
    /// Tells a client to reconnect to a less loaded server.
    Redirect { hostname: String, port: u16 },
    Logout,
    ActivityMessage {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        activity: Activity,
    },
    ActivityBroadcast { activity: Activity },
    /// Periodic gossip: a server's identity, address and client load.
    ServerAnnounce {
        id: String,
        load: u32,
        hostname: String,
        port: u16,
    },
    Register { username: String, secret: String },
    RegisterSuccess { info: String },
    RegisterFailed { info: String },
    LockRequest { username: String, secret: String },
    LockAllowed { username: String, secret: String },
    LockDenied { username: String, secret: String },
}

/// Errors that can occur while decoding a line into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid message: {0}")]
    Json(#[source] serde_json::Error),
    #[error("missing command")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid {command} message: {source}")]
    Fields {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Message {
    /// Parse a single message from one line of input (without the newline).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(input.trim()).map_err(ParseError::Json)?;

        let command = value
            .get("command")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingCommand)?
            .to_owned();

        if !COMMANDS.contains(&command.as_str()) {
            return Err(ParseError::UnknownCommand(command));
        }

        serde_json::from_value(value).map_err(|source| ParseError::Fields { command, source })
    }

    /// Serialize to the wire format (without the trailing newline).
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The wire name of this message's command.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "AUTHENTICATE",
            Self::AuthenticationFail { .. } => "AUTHENTICATION_FAIL",
            Self::InvalidMessage { .. } => "INVALID_MESSAGE",
            Self::Login { .. } => "LOGIN",
            Self::LoginSuccess { .. } => "LOGIN_SUCCESS",
            Self::LoginFailed { .. } => "LOGIN_FAILED",
            Self::Redirect { .. } => "REDIRECT",
            Self::Logout => "LOGOUT",
            Self::ActivityMessage { .. } => "ACTIVITY_MESSAGE",
            Self::ActivityBroadcast { .. } => "ACTIVITY_BROADCAST",
            Self::ServerAnnounce { .. } => "SERVER_ANNOUNCE",
            Self::Register { .. } => "REGISTER",
            Self::RegisterSuccess { .. } => "REGISTER_SUCCESS",
            Self::RegisterFailed { .. } => "REGISTER_FAILED",
            Self::LockRequest { .. } => "LOCK_REQUEST",
            Self::LockAllowed { .. } => "LOCK_ALLOWED",
            Self::LockDenied { .. } => "LOCK_DENIED",
        }
    }

    pub fn invalid(info: impl Into<String>) -> Self {
        Self::InvalidMessage { info: info.into() }
    }

    pub fn authentication_fail(info: impl Into<String>) -> Self {
        Self::AuthenticationFail { info: info.into() }
    }

    pub fn login_success(info: impl Into<String>) -> Self {
        Self::LoginSuccess { info: info.into() }
    }

    pub fn login_failed(info: impl Into<String>) -> Self {
        Self::LoginFailed { info: info.into() }
    }

    pub fn register_success(info: impl Into<String>) -> Self {
        Self::RegisterSuccess { info: info.into() }
    }

    pub fn register_failed(info: impl Into<String>) -> Self {
        Self::RegisterFailed { info: info.into() }
    }
}

impl ParseError {
    /// The reply sent to a peer whose line could not be decoded.
    pub fn reply(&self) -> Message {
        Message::invalid(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_authenticate() {
        let msg = Message::parse(r#"{"command":"AUTHENTICATE","secret":"abc"}"#).unwrap();
        assert_eq!(msg, Message::Authenticate { secret: "abc".into() });
    }

    #[test]
    fn parse_logout_has_no_fields() {
        let msg = Message::parse(r#"{"command":"LOGOUT"}"#).unwrap();
        assert_eq!(msg, Message::Logout);
    }

    #[test]
    fn parse_anonymous_login_without_secret() {
        let msg = Message::parse(r#"{"command":"LOGIN","username":"anonymous"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Login {
                username: ANONYMOUS.into(),
                secret: None,
            }
        );
    }

    #[test]
    fn parse_server_announce() {
        let line = r#"{"command":"SERVER_ANNOUNCE","id":"s1","load":3,"hostname":"h","port":4000}"#;
        let msg = Message::parse(line).unwrap();
        assert_eq!(
            msg,
            Message::ServerAnnounce {
                id: "s1".into(),
                load: 3,
                hostname: "h".into(),
                port: 4000,
            }
        );
    }

    #[test]
    fn parse_activity_keeps_arbitrary_object() {
        let line = r#"{"command":"ACTIVITY_MESSAGE","username":"alice","secret":"s","activity":{"text":"hi","n":[1,2]}}"#;
        let Message::ActivityMessage { activity, .. } = Message::parse(line).unwrap() else {
            panic!("expected ACTIVITY_MESSAGE");
        };
        assert_eq!(Value::Object(activity), json!({"text": "hi", "n": [1, 2]}));
    }

    #[test]
    fn parse_tolerates_surrounding_whitespace() {
        let msg = Message::parse("  {\"command\":\"LOGOUT\"}\r").unwrap();
        assert_eq!(msg, Message::Logout);
    }

    // ── Parse errors ─────────────────────────────────────────────

    #[test]
    fn parse_rejects_non_json() {
        let err = Message::parse("LOGIN alice").unwrap_err();
        assert!(matches!(err, ParseError::Json(_)));
    }

    #[test]
    fn parse_rejects_missing_command() {
        let err = Message::parse(r#"{"username":"alice"}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingCommand));
    }

    #[test]
    fn parse_rejects_non_string_command() {
        let err = Message::parse(r#"{"command":7}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingCommand));
    }

    #[test]
    fn parse_rejects_unknown_command() {
        let err = Message::parse(r#"{"command":"SHOUT"}"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownCommand(ref c) if c == "SHOUT"));
        assert_eq!(err.to_string(), "unknown command: SHOUT");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let err = Message::parse(r#"{"command":"REGISTER","username":"alice"}"#).unwrap_err();
        assert!(matches!(err, ParseError::Fields { ref command, .. } if command == "REGISTER"));
    }

    #[test]
    fn parse_rejects_activity_that_is_not_an_object() {
        let line = r#"{"command":"ACTIVITY_BROADCAST","activity":"nope"}"#;
        assert!(matches!(Message::parse(line), Err(ParseError::Fields { .. })));
    }

    #[test]
    fn parse_rejects_negative_load() {
        let line = r#"{"command":"SERVER_ANNOUNCE","id":"s1","load":-1,"hostname":"h","port":1}"#;
        assert!(matches!(Message::parse(line), Err(ParseError::Fields { .. })));
    }

    #[test]
    fn parse_error_reply_is_invalid_message() {
        let err = Message::parse("{").unwrap_err();
        assert!(matches!(err.reply(), Message::InvalidMessage { .. }));
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn wire_uses_command_tag() {
        let wire = Message::Redirect {
            hostname: "b.example".into(),
            port: 3781,
        }
        .to_wire()
        .unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            value,
            json!({"command": "REDIRECT", "hostname": "b.example", "port": 3781})
        );
    }

    #[test]
    fn wire_omits_absent_secret() {
        let wire = Message::Login {
            username: ANONYMOUS.into(),
            secret: None,
        }
        .to_wire()
        .unwrap();
        assert!(!wire.contains("secret"));
    }

    #[test]
    fn command_name_matches_wire_tag() {
        let msg = Message::LockDenied {
            username: "alice".into(),
            secret: "s".into(),
        };
        let value: Value = serde_json::from_str(&msg.to_wire().unwrap()).unwrap();
        assert_eq!(value["command"], msg.command());
    }
}
