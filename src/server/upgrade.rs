//! WebSocket upgrade handshake (component G).
//!
//! Computes `Sec-WebSocket-Accept` per RFC 6455 and hands the raw
//! post-upgrade byte stream to the connection manager's mailbox. This
//! reuses the teacher's `hyper::upgrade::on(req)` pattern from its CONNECT
//! tunnel handler verbatim — both need a success response followed by raw
//! access to the upgraded duplex stream — rather than pulling in a
//! higher-level WebSocket crate that would hide the frame-level control
//! spec component E requires.

use base64::Engine;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::streaming::connection::{IncomingConnection, Mailbox};
use crate::streaming::stream::SendBackend;
use crate::streaming::ws_frame;

const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_header = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_header && has_connection_upgrade
}

/// Handle a `GET <websocket_uri>` request. On success, spawns a task that
/// completes the raw upgrade and hands the stream to `mailbox`; if the
/// mailbox is already occupied (a streamer is active), writes a CLOSE 1013
/// frame directly onto the newly-upgraded stream and closes it — the
/// connection manager never observes that handle, per spec §4.D.
pub fn handle_upgrade(
    mut req: Request<Incoming>,
    mailbox: Mailbox,
) -> Response<http_body_util::Empty<Bytes>> {
    if !is_upgrade_request(&req) {
        return bad_request("expected a WebSocket upgrade request");
    }

    let client_key = match req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
    {
        Some(k) => k.to_string(),
        None => return bad_request("missing Sec-WebSocket-Key"),
    };

    let accept = accept_key(&client_key);

    tokio::task::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = hyper_util::rt::TokioIo::new(upgraded);
                let conn = IncomingConnection {
                    socket: Box::new(io),
                    backend: SendBackend::WebSocket,
                };
                if let Err(rejected) = mailbox.try_send(conn) {
                    warn!("second WebSocket client attempt rejected: try again later");
                    reject_busy(rejected.into_inner()).await;
                }
            }
            Err(e) => warn!(error = %e, "WebSocket upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .header("Sec-WebSocket-Accept", accept)
        .body(http_body_util::Empty::new())
        .unwrap()
}

async fn reject_busy(conn: IncomingConnection) {
    use tokio::io::AsyncWriteExt;
    let frame = ws_frame::try_again_later_frame();
    let mut socket = conn.socket;
    if let Err(e) = socket.write_all(&frame).await {
        debug!(error = %e, "failed writing CLOSE 1013 to rejected client");
    }
    let _ = socket.shutdown().await;
}

fn bad_request(msg: &str) -> Response<http_body_util::Empty<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("X-Error", msg)
        .body(http_body_util::Empty::new())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(accept_key(key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
