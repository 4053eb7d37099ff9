//! HTTP surface of the relay: the channel upgrade and public forwarding.

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use burrow_shared::{Headers, RequestEnvelope, ResponseEnvelope};
use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, OUTBOUND_CAPACITY};
use crate::pending::Outcome;
use crate::registry::RouteKey;
use crate::state::RelayState;

pub const NO_CHANNEL_MESSAGE: &str = "No tunnel client connected. Did you forget to start burrow?";

pub fn router(state: RelayState) -> Router {
    let channel_path = state.config.channel_path.clone();
    Router::new()
        .route(&channel_path, any(channel_handler))
        .fallback(public_handler)
        .with_state(state)
}

/// Upgrades on the channel path attach a bridge; anything else on that
/// path is ordinary public traffic.
async fn channel_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<RelayState>,
    req: Request,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| serve_channel(socket, state)),
        None => forward(state, req).await,
    }
}

async fn public_handler(State(state): State<RelayState>, req: Request) -> Response {
    forward(state, req).await
}

async fn serve_channel(socket: WebSocket, state: RelayState) {
    let (channel, mut outbound) = ChannelHandle::open(OUTBOUND_CAPACITY);
    let id = channel.id();

    match state.registry.register(channel.clone()) {
        // The superseded channel stays open until its bridge hangs up, but
        // no new traffic reaches it and what it still owes is failed now.
        Some(previous) => {
            let failed = state.pending.fail_channel(previous.id());
            info!(
                "Channel {} attached, superseding {} ({} pending request(s) failed)",
                id,
                previous.id(),
                failed
            );
        }
        None => info!("Channel {} attached", id),
    }

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_envelope(&state, &text),
                    Some(Ok(Message::Ping(d))) => { let _ = sender.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Channel {} transport error: {}", id, e);
                        break;
                    }
                    _ => {}
                }
            }
            Some(text) = outbound.recv() => {
                if sender.send(Message::Text(text)).await.is_err() { break; }
            }
        }
    }

    // Close the queue before failing entries: a request that still manages
    // to enqueue was registered first and gets failed below.
    outbound.close();
    state.registry.deregister(id);
    let failed = state.pending.fail_channel(id);
    info!(
        "Channel {} closed after {:?}, failed {} pending request(s)",
        id,
        channel.opened_at().elapsed(),
        failed
    );
}

fn handle_envelope(state: &RelayState, text: &str) {
    match ResponseEnvelope::from_message(text) {
        Ok(resp) => {
            let id = resp.id.clone();
            if !state.pending.complete(resp) {
                debug!("Discarding response for unknown request {}", id);
            }
        }
        Err(e) => warn!("Discarding malformed envelope: {}", e),
    }
}

async fn forward(state: RelayState, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers: Headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str(), val)))
        .collect();

    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            warn!("{} {} rejected: {}", method, url, e);
            return gateway(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large or unreadable");
        }
    };

    let channel = {
        let key = RouteKey {
            host: headers.get("host"),
            path: &url,
        };
        state.registry.route(&key)
    };
    let Some(channel) = channel else {
        warn!("{} {} with no tunnel client attached", method, url);
        return gateway(StatusCode::BAD_GATEWAY, NO_CHANNEL_MESSAGE);
    };
    if !channel.is_writable() {
        return gateway(StatusCode::BAD_GATEWAY, "Tunnel client socket is not open: closed");
    }

    let (id, rx) = state.pending.open(channel.id(), state.config.request_timeout);
    let _guard = state.pending.guard(id.clone());
    info!("{} {} -> request {}", method, url, id);

    let text = match RequestEnvelope::new(id.clone(), &method, &url, headers, &body).to_message() {
        Ok(t) => t,
        Err(e) => {
            warn!("Failed to encode request {}: {}", id, e);
            return gateway(StatusCode::INTERNAL_SERVER_ERROR, "Serialization error");
        }
    };
    if channel.send(text).await.is_err() {
        return gateway(StatusCode::BAD_GATEWAY, "Tunnel client socket is not open: closed");
    }

    match rx.await {
        Ok(Outcome::Delivered(resp)) => build_response(resp),
        Ok(Outcome::TimedOut) => gateway(
            StatusCode::GATEWAY_TIMEOUT,
            &format!(
                "Tunnel client did not respond within {}s",
                state.config.request_timeout.as_secs_f64()
            ),
        ),
        Ok(Outcome::ChannelClosed) | Err(_) => gateway(
            StatusCode::BAD_GATEWAY,
            "Tunnel client disconnected before responding",
        ),
    }
}

fn build_response(resp: ResponseEnvelope) -> Response {
    let Some(status) = resp.status().and_then(|s| StatusCode::from_u16(s).ok()) else {
        return gateway(StatusCode::BAD_GATEWAY, "Local service returned no status");
    };
    let body = match resp.decode_body() {
        Ok(b) => b,
        Err(e) => {
            warn!("Response {} has an undecodable body: {}", resp.id, e);
            return gateway(StatusCode::BAD_GATEWAY, "Malformed response from tunnel client");
        }
    };

    let mut headers = resp.headers;
    headers.strip_hop_by_hop();

    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in headers.iter() {
            if let (Ok(hn), Ok(hv)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                headers_mut.append(hn, hv);
            }
        }
    }
    match builder.body(Body::from(body)) {
        Ok(r) => r,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

fn gateway(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.to_string(),
    )
        .into_response()
}
