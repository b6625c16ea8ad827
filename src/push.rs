//! ==============================================================================
//! push.rs - realtime push channel
//! ==============================================================================
//!
//! purpose:
//!     opens the receive-only websocket at /ws/live/{location}?token=... and
//!     hands text frames to the engine as a stream. the engine only sees the
//!     PushConnector trait, so tests drive it with in-memory frames.
//!
//! url derivation:
//!     http://host:8000   ->  ws://host:8000/ws/live/{location}?token=...
//!     https://host       ->  wss://host/ws/live/{location}?token=...
//!
//! ==============================================================================

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Url;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("invalid push url: {0}")]
    InvalidUrl(String),
}

/// text frames until the socket closes; an Err item ends the connection
pub type FrameStream = BoxStream<'static, Result<String, PushError>>;

#[async_trait]
pub trait PushConnector: Send + Sync + 'static {
    async fn connect(&self, location_id: &str, token: &str) -> Result<FrameStream, PushError>;
}

/// push url for a location, derived from the rest base url
pub fn live_url(api_base: &Url, location_id: &str, token: &str) -> Result<Url, PushError> {
    let mut url = api_base.clone();
    let scheme = match api_base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(PushError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| PushError::InvalidUrl(api_base.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| PushError::InvalidUrl(api_base.to_string()))?
        .pop_if_empty()
        .extend(["ws", "live", location_id]);
    url.set_query(None);
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// tokio-tungstenite backed connector
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    api_base: Url,
}

impl WebSocketConnector {
    pub fn new(api_base: Url) -> Self {
        Self { api_base }
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, location_id: &str, token: &str) -> Result<FrameStream, PushError> {
        let url = live_url(&self.api_base, location_id, token)?;
        // the query carries the token, keep it out of the logs
        info!(location = %location_id, host = ?url.host_str(), "connecting push channel");

        let (socket, _response) = connect_async(url.as_str()).await?;

        let frames = socket.filter_map(|msg| async move { frame_text(msg) });
        Ok(frames.boxed())
    }
}

/// text payload of one socket message. undecodable binary frames are
/// dropped here like any other malformed message; only transport errors
/// end the stream.
fn frame_text(msg: Result<Message, tungstenite::Error>) -> Option<Result<String, PushError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Some(Ok(text)),
            Err(e) => {
                warn!(len = e.as_bytes().len(), "dropping non-utf8 push frame");
                None
            }
        },
        Ok(Message::Close(frame)) => {
            debug!(?frame, "push channel closed by server");
            None
        }
        // ping/pong are answered by tungstenite
        Ok(_) => None,
        Err(e) => Some(Err(PushError::Socket(e))),
    }
}
