use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use activitystream::server::config::{Cli, Settings};
use activitystream::server::control::{wait_until_stopped, Control, RunState};
use activitystream::server::error::ServerError;
use activitystream::server::listener::Listener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let settings = Settings::from(Cli::parse());
    info!(
        hostname = %settings.local_hostname,
        port = settings.local_port,
        "starting activity stream server"
    );

    let control = Control::new(settings);
    let listener = Listener::bind(Arc::clone(&control)).await?;
    control.connect_remote().await?;

    let ticker = tokio::spawn(Arc::clone(&control).run_ticker());
    let accept = tokio::spawn(listener.run());

    let mut state = control.subscribe();
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("termination signal received");
            Ok(())
        }
        stopped = wait_until_stopped(&mut state) => match stopped {
            RunState::Failed(reason) => Err(ServerError::Aborted(reason)),
            _ => Ok(()),
        },
    };

    control.shutdown().await;
    let _ = ticker.await;
    match accept.await {
        Ok(Err(e)) => error!("listener: {e}"),
        Err(e) => error!("listener task: {e}"),
        Ok(Ok(())) => {}
    }

    info!("server stopped");
    Ok(outcome?)
}
