mod api;

use api::{create_router, ApiState};
use chrono::Utc;
use log::{error, info};
use sol_relay_core::{
    native::{HttpRpcForwarder, TungsteniteConnector},
    settings::redact_url,
    Relay, RelayError, RelayHandle, Settings,
};
use std::sync::Arc;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

type AppError = RelayError;

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), AppError> {
    env_logger::init();
    // Print an unconditional startup line so users see the binary started
    // even when RUST_LOG is not set.
    println!(
        "sol_relay starting (pid {}), RUST_LOG={:?}",
        std::process::id(),
        std::env::var("RUST_LOG").ok()
    );

    let config_path =
        std::env::var("SOL_RELAY_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let settings = Settings::from_file(&config_path)?;
    settings.validate()?;

    if std::env::args().any(|arg| arg == "--print-config") {
        println!("{}", settings.redacted().to_toml()?);
        return Ok(());
    }

    let connector = Arc::new(TungsteniteConnector::new(settings.upstream_ping_interval()));
    let (relay, relay_task) = Relay::start(&settings, connector)?;

    let http_url = settings.upstream_http_endpoint()?;
    info!("HTTP RPC passthrough: {}", redact_url(&http_url));
    let api_state = ApiState {
        relay: relay.clone(),
        forwarder: Arc::new(HttpRpcForwarder::new(http_url.to_string())),
        started_at: Utc::now(),
    };

    let bind_addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Relay listening on {} (WebSocket at /ws)", bind_addr);

    axum::serve(listener, create_router(api_state))
        .with_graceful_shutdown(shutdown_on_signal(relay.clone()))
        .await?;

    // no-op when the signal path already stopped it
    relay.stop();
    if let Err(e) = relay_task.await {
        error!("Relay task panicked or exited unexpectedly: {:?}", e);
    }
    Ok(())
}

/// Resolves once the process is asked to stop, after telling the relay to
/// close its upstream and every client socket.
async fn shutdown_on_signal(relay: RelayHandle) {
    match next_shutdown_signal().await {
        Ok(name) => info!("{} received; stopping relay", name),
        Err(e) => error!("Failed to listen for shutdown signals: {}", e),
    }
    relay.stop();
}

async fn next_shutdown_signal() -> Result<&'static str, AppError> {
    #[cfg(unix)]
    {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        };
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

#[cfg(unix)]
#[cfg(test)]
mod shutdown_tests {
    use super::*;
    use tokio::time::Duration;

    fn idle_settings() -> Settings {
        Settings {
            upstream_ws_url: "wss://rpc.example.com/".to_string(),
            upstream_http_url: None,
            api_key: None,
            api_key_param: "api-key".to_string(),
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            upstream_ping_interval_secs: 30,
            connect_on_start: false,
        }
    }

    #[tokio::test]
    async fn sigterm_stops_the_relay_and_its_clients() {
        let connector = Arc::new(TungsteniteConnector::new(Duration::from_secs(30)));
        let (relay, relay_task) = Relay::start(&idle_settings(), connector).unwrap();
        let mut client = relay.connect_client().unwrap();

        tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            unsafe { libc::raise(libc::SIGTERM); }
        });
        shutdown_on_signal(relay.clone()).await;

        tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert!(client.outbound.recv().await.is_none());
        assert!(relay.status().await.is_err());
    }
}
