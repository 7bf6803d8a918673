// Router assembly, shared middleware and the two-listener serve loop.

use std::future::{Future, IntoFuture};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{attach_request_id_header, request_id_from_headers_or_generate};
use crate::metrics::global_metrics;
use crate::{health, ws, ws::RelayState};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

pub fn build_relay_router(state: RelayState) -> Router {
    apply_middleware(ws::router(state))
}

pub fn build_health_router(state: RelayState) -> Router {
    apply_middleware(health::router(state))
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// Serve the relay and health listeners until `signal` fires, then drain
/// sessions within `grace` before both listeners stop.
pub async fn serve<S>(
    relay_listener: TcpListener,
    health_listener: TcpListener,
    state: RelayState,
    grace: Duration,
    signal: S,
) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let relay_stopped = state.shutdown.clone();
    let health_stopped = state.shutdown.clone();
    let coordinator = state.shutdown.clone();
    let registry = state.registry.clone();

    let relay = axum::serve(relay_listener, build_relay_router(state.clone()))
        .with_graceful_shutdown(async move { relay_stopped.stopped().await })
        .into_future();
    let health = axum::serve(health_listener, build_health_router(state))
        .with_graceful_shutdown(async move { health_stopped.stopped().await })
        .into_future();
    let drain = async move {
        signal.await;
        coordinator.drain(&registry, grace).await;
    };

    let (relay_result, health_result, ()) = tokio::join!(relay, health, drain);
    relay_result.context("relay listener exited unexpectedly")?;
    health_result.context("health listener exited unexpectedly")?;
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    global_metrics().record_http_request(method.as_str(), &path, status);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
