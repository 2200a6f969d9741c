//! HTTP server & WebSocket upgrade (component G, SPEC_FULL.md §4.G).
//!
//! One `hyper` HTTP/1.1 listener dispatches by method+path: the configured
//! WebSocket URI upgrades into the streaming connection manager's mailbox
//! (§4.D); the JSON-RPC path drives the subscribe/unsubscribe control
//! channel (component F); everything else is `404`. Grounded on the
//! teacher's `proxy::server::run` accept-loop/`service_fn` routing shape.

pub mod upgrade;

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::streaming::connection::{ActiveStream, Mailbox};
use crate::streaming::jsonrpc;
use crate::streaming::registry::{SampleSource, SignalRegistry};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

fn boxed<B>(body: B) -> BoxBody
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    body.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        .boxed()
}

/// Run the HTTP control server until `shutdown` fires. `mailbox` is `Some`
/// only when the WebSocket transport is enabled; in raw-TCP builds the
/// server still carries the JSON-RPC endpoint, just not the upgrade path.
pub async fn run(
    config: Arc<Config>,
    registry: Arc<SignalRegistry>,
    source: Arc<dyn SampleSource>,
    active_stream: ActiveStream,
    mailbox: Option<Mailbox>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP control server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "HTTP connection accepted");

                let config = Arc::clone(&config);
                let registry = Arc::clone(&registry);
                let source = Arc::clone(&source);
                let active_stream = active_stream.clone();
                let mailbox = mailbox.clone();

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let config = Arc::clone(&config);
                        let registry = Arc::clone(&registry);
                        let source = Arc::clone(&source);
                        let active_stream = active_stream.clone();
                        let mailbox = mailbox.clone();
                        async move {
                            Ok::<_, Infallible>(
                                route(req, config, registry, source, active_stream, mailbox).await,
                            )
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        if !e.to_string().contains("connection closed") {
                            debug!(peer = %peer, error = %e, "connection error");
                        }
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("shutdown requested, HTTP control server exiting");
                return Ok(());
            }
        }
    }
}

async fn route(
    req: Request<Incoming>,
    config: Arc<Config>,
    registry: Arc<SignalRegistry>,
    source: Arc<dyn SampleSource>,
    active_stream: ActiveStream,
    mailbox: Option<Mailbox>,
) -> Response<BoxBody> {
    if req.method() == Method::GET && req.uri().path() == config.websocket_uri {
        return match mailbox {
            Some(mailbox) => upgrade::handle_upgrade(req, mailbox).map(boxed),
            None => not_found(),
        };
    }

    if req.method() == Method::POST && req.uri().path() == config.jsonrpc_path {
        return handle_jsonrpc(req, registry, source, active_stream).await;
    }

    not_found()
}

async fn handle_jsonrpc(
    req: Request<Incoming>,
    registry: Arc<SignalRegistry>,
    source: Arc<dyn SampleSource>,
    active_stream: ActiveStream,
) -> Response<BoxBody> {
    let stream = active_stream.read().clone();
    let Some(stream) = stream else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "no active stream");
    };

    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read JSON-RPC request body");
            return json_error(StatusCode::BAD_REQUEST, "malformed body");
        }
    };

    let resp = jsonrpc::handle_request(&body, &registry, &stream, source.as_ref());
    let payload = serde_json::to_vec(&resp).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(boxed(Full::new(Bytes::from(payload))))
        .unwrap()
}

fn json_error(status: StatusCode, message: &str) -> Response<BoxBody> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": { "code": -32602, "message": message },
    });
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(boxed(Full::new(Bytes::from(
            serde_json::to_vec(&body).unwrap_or_default(),
        ))))
        .unwrap()
}

fn not_found() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(boxed(Empty::<Bytes>::new()))
        .unwrap()
}
