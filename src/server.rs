use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;

/// Serves `app` on `addr` until `shutdown` resolves, then lets in-flight
/// requests finish.
pub async fn serve(
    app: Router,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on {}", listener.local_addr()?);
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
        })
        .await?;
    log::info!("HTTP server stopped");
    Ok(())
}
