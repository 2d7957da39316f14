//! Single-session transport over stdin/stdout.

use std::sync::Arc;

use tracing::info;

use crate::service::DebugService;

/// Serve one session on stdin/stdout, then shut the service down.
///
/// Logging must not write to stdout while this runs.
pub async fn serve_stdio(service: Arc<DebugService>) -> anyhow::Result<()> {
    info!("Serving debug session on stdio");

    let result = service
        .run_session(tokio::io::stdin(), tokio::io::stdout())
        .await;

    service.shutdown().await;
    result?;
    Ok(())
}
