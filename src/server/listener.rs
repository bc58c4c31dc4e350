/// TCP accept loop.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::control::{wait_until_stopped, Control};
use super::error::ServerError;

pub struct Listener {
    listener: TcpListener,
    control: Arc<Control>,
}

impl Listener {
    /// Bind on all interfaces at the configured local port.
    pub async fn bind(control: Arc<Control>) -> Result<Self, ServerError> {
        let addr = format!("0.0.0.0:{}", control.settings().local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self::new(listener, control))
    }

    /// Use an already bound socket.
    pub fn new(listener: TcpListener, control: Arc<Control>) -> Self {
        Self { listener, control }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown or an accept error.
    pub async fn run(self) -> Result<(), ServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "listening");
        }
        let mut state = self.control.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, addr) = accepted.map_err(|e| {
                        error!("accept failed, listener stopping: {e}");
                        ServerError::Io(e)
                    })?;
                    self.control.incoming(socket, addr).await;
                }
                _ = wait_until_stopped(&mut state) => {
                    info!("listener stopped");
                    return Ok(());
                }
            }
        }
    }
}
