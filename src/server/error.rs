use std::io;

/// Fatal server errors: startup failures and lost listeners.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("refusing to connect to ourselves at {addr}")]
    SelfConnect { addr: String },
    #[error("server aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
