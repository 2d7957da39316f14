//! TCP listener transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

use crate::service::DebugService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5678,
        }
    }
}

/// Bind and accept debug clients until a shutdown signal arrives.
pub async fn serve(config: ServerConfig, service: Arc<DebugService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, service, shutdown_signal).await
}

/// Accept loop over an already bound listener.
///
/// `signal` builds the future that ends the loop besides
/// [`DebugService::trigger_shutdown`].
pub async fn serve_listener<F, Fut>(
    listener: TcpListener,
    service: Arc<DebugService>,
    signal: F,
) -> anyhow::Result<()>
where
    F: FnOnce(watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let actual_addr = listener.local_addr()?;
    info!("Starting debuglet server on {}", actual_addr);

    let shutdown = signal(service.shutdown_rx());
    tokio::pin!(shutdown);
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%peer, error = %e, "Could not set TCP_NODELAY");
                }
                info!(%peer, "Accepted debug client");

                let service = Arc::clone(&service);
                sessions.spawn(async move {
                    let (reader, writer) = stream.into_split();
                    // Errors are logged by the session itself.
                    let _ = service.run_session(reader, writer).await;
                    info!(%peer, "Debug client disconnected");
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    // Open sessions are dropped, which detaches them from their debuggees.
    sessions.shutdown().await;
    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}

/// Wait for SIGINT, SIGTERM, SIGHUP or [`DebugService::trigger_shutdown`].
///
/// If OS signals cannot be watched, only the explicit trigger ends the wait.
pub async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let os_signal = async {
        match wait_for_os_signal().await {
            Ok(signal) => info!(signal, "Shutting down debuglet server"),
            Err(e) => {
                tracing::error!(error = %e, "Cannot watch shutdown signals");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = os_signal => {}
        _ = explicit_shutdown(&mut shutdown_rx) => {
            info!("Shutdown requested, stopping debuglet server");
        }
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    })
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

async fn explicit_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::framed::MessageReader;
    use crate::bridge::protocol::Message;
    use crate::service::ServiceConfig;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5678);
    }

    #[tokio::test]
    async fn accepted_client_receives_telemetry_then_server_stops() {
        let service = Arc::new(DebugService::new(ServiceConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(serve_listener(
            listener,
            Arc::clone(&service),
            shutdown_signal,
        ));

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut reader = MessageReader::new(stream);
        match reader.read_message().await.unwrap().unwrap() {
            Message::Event(event) => {
                assert_eq!(event.seq, 0);
                assert_eq!(event.event, "output");
                assert_eq!(event.body.unwrap()["category"], "telemetry");
            }
            other => panic!("expected telemetry event, got {other:?}"),
        }

        service.trigger_shutdown();
        server.await.unwrap().unwrap();
    }
}
