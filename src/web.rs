//! HTTP listener: `PUT /send` with a JSON message as the body.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::put,
    Router,
};

use crate::dispatch::Dispatcher;

/// Build the router for the HTTP listener.
pub fn routes(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/send", put(send_handler))
        .with_state(dispatcher)
}

/// Dispatch the request body, then reply with an empty `200 OK`.
///
/// A body that can't be read is logged and rejected with the extractor's own
/// status (`400`, or `413` when over the body limit); nothing is dispatched.
async fn send_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            log::error!("Failed to read body of request: {}", rejection.body_text());
            return rejection.into_response();
        }
    };

    dispatcher.dispatch(&body).await;
    StatusCode::OK.into_response()
}

/// Serve the HTTP listener on `addr` until `shutdown` completes.
pub async fn serve<F>(addr: SocketAddr, dispatcher: Arc<Dispatcher>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;

    log::info!("Listening for PUT /send on {}", addr);

    axum::serve(listener, routes(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    Ok(())
}
