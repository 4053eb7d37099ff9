//! Bridge client: the channel to the relay and the replay loop.

use burrow_shared::{Error, RequestEnvelope, Result};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::proxy::LocalService;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Replies buffered before replay tasks wait on the writer
const REPLY_CAPACITY: usize = 100;

/// Why the channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    /// The relay closed the channel, with its reason if any
    Closed(Option<String>),
    /// Transport error
    Failed(String),
    /// Closed locally through `Bridge::close`
    Shutdown,
}

impl fmt::Display for ChannelEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEnd::Closed(Some(reason)) => write!(f, "closed by relay: {}", reason),
            ChannelEnd::Closed(None) => write!(f, "closed by relay"),
            ChannelEnd::Failed(e) => write!(f, "transport error: {}", e),
            ChannelEnd::Shutdown => write!(f, "shut down"),
        }
    }
}

/// Channel establishment retry with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// An established channel. Requests are served on a background task
/// until the channel ends or `close` is called.
pub struct Bridge {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<ChannelEnd>>,
    ended: Option<ChannelEnd>,
}

/// Open the channel. Returns only once the upgrade completed, so a
/// returned bridge can carry traffic immediately.
pub async fn connect(channel_url: &str, local: LocalService) -> Result<Bridge> {
    info!("Connecting to relay: {}", channel_url);

    let (ws_stream, _) = connect_async(channel_url)
        .await
        .map_err(|e| Error::Channel(format!("Failed to connect to relay at {}: {}", channel_url, e)))?;

    info!("Channel open, forwarding to localhost:{}", local.port());

    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(serve(ws_stream, local, stop_rx));
    Ok(Bridge {
        stop: Some(stop_tx),
        task: Some(task),
        ended: None,
    })
}

/// `connect`, retried while the relay is still starting up
pub async fn connect_with_retry(channel_url: &str, local: LocalService, policy: &RetryPolicy) -> Result<Bridge> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match connect(channel_url, local.clone()).await {
            Ok(bridge) => return Ok(bridge),
            Err(e) if attempt < attempts => {
                warn!("Attempt {}/{}: {}. Retrying in {:?}", attempt, attempts, e, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl Bridge {
    pub fn is_open(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Wait for the channel to end. Cancel safe.
    pub async fn closed(&mut self) -> ChannelEnd {
        if let Some(task) = self.task.as_mut() {
            let end = task
                .await
                .unwrap_or_else(|e| ChannelEnd::Failed(format!("bridge task failed: {}", e)));
            self.task = None;
            self.ended = Some(end);
        }
        self.ended.clone().unwrap_or(ChannelEnd::Shutdown)
    }

    /// Close the channel if it is still open
    pub async fn close(&mut self) -> ChannelEnd {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.closed().await
    }
}

async fn serve(ws_stream: WsStream, local: LocalService, mut stop: oneshot::Receiver<()>) -> ChannelEnd {
    let (mut write, mut read) = ws_stream.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(REPLY_CAPACITY);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let local = local.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = handle_envelope(&local, &text).await {
                                let _ = reply_tx.send(reply).await;
                            }
                        });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return ChannelEnd::Failed(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        info!("Channel closed by relay");
                        return ChannelEnd::Closed(reason);
                    }
                    None => {
                        info!("Channel closed");
                        return ChannelEnd::Closed(None);
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return ChannelEnd::Failed(e.to_string());
                    }
                    _ => {}
                }
            }
            Some(reply) = reply_rx.recv() => {
                if let Err(e) = write.send(Message::Text(reply)).await {
                    error!("Failed to send response: {}", e);
                    return ChannelEnd::Failed(e.to_string());
                }
            }
            _ = &mut stop => {
                info!("Closing channel");
                let _ = write.send(Message::Close(None)).await;
                return ChannelEnd::Shutdown;
            }
        }
    }
}

/// Replay one request envelope; `None` if it could not be parsed
async fn handle_envelope(local: &LocalService, text: &str) -> Option<String> {
    let request = match RequestEnvelope::from_message(text) {
        Ok(r) => r,
        Err(e) => {
            warn!("Discarding malformed envelope: {}", e);
            return None;
        }
    };
    let response = local.replay(request).await;
    match response.to_message() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Failed to encode response {}: {}", response.id, e);
            None
        }
    }
}

/// Channel URL for a relay's public base URL
pub fn channel_url(public_url: &str, channel_path: &str) -> Result<String> {
    let base = public_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(Error::Channel(format!("Unsupported relay URL: {}", public_url)));
    };
    Ok(format!("{}{}", ws_base, channel_path))
}
