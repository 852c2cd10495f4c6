//! Admin HTTP surface.

pub mod admin;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::context::ServiceContext;

pub use admin::admin_routes;

/// Serve the admin API on `addr` until `shutdown` flips.
pub async fn serve(
    ctx: Arc<ServiceContext>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, admin_routes(ctx))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
