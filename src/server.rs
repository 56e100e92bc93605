//! HTTP server wiring: routes, middleware and the listener loop.

use axum::{
    Router,
    extract::Extension,
    middleware,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::mutation::handlers::{
    AuthKey, access_log, handle_action, handle_fetch_builder, handle_fetch_ring,
    handle_head_builder, handle_head_ring, handle_list, require_key,
};
use crate::mutation::protocol::{ENDPOINT_BUILDER, ENDPOINT_RING};
use crate::mutation::service::CatalogService;

pub fn router(service: Arc<CatalogService>, key: &str) -> Router {
    Router::new()
        .route(
            &format!("{}/:file", ENDPOINT_BUILDER),
            get(handle_fetch_builder).head(handle_head_builder),
        )
        .route(
            &format!("{}/:file", ENDPOINT_RING),
            get(handle_fetch_ring).head(handle_head_ring),
        )
        .route(
            &format!("{}/:category/:action", ENDPOINT_BUILDER),
            get(handle_list).post(handle_action),
        )
        .layer(Extension(service))
        .layer(middleware::from_fn_with_state(
            AuthKey(Arc::from(key)),
            require_key,
        ))
        .layer(middleware::from_fn(access_log))
}

pub async fn serve(bind: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("HTTP server listening on {}", listener.local_addr()?);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
