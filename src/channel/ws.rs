use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use studio_core::ProjectId;

use super::{Connector, Frame, FrameStream, TransportError};

/// Connects to the dashboard WebSocket of the Haiku Studio server.
///
/// The endpoint is `<ws base>/projects/dashboard/<project id>`. The base is
/// normally derived from the HTTP base URL by swapping the scheme.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    /// Create with an explicit `ws://` or `wss://` base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Derive the WebSocket base from the HTTP API base URL.
    pub fn from_http_base(http_base: &str) -> Self {
        let base = if let Some(rest) = http_base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = http_base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            http_base.to_string()
        };
        Self::new(base)
    }

    pub fn url_for(&self, project_id: &ProjectId) -> String {
        format!("{}/projects/dashboard/{}", self.base_url, project_id)
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        project_id: &ProjectId,
    ) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = self.url_for(project_id);
        async move {
            tracing::debug!("Opening push channel {}", url);
            let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

            let frames = stream
                .filter_map(|message| futures::future::ready(into_frame(message)))
                .boxed();
            Ok(frames)
        }
        .boxed()
    }
}

fn into_frame(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        // Non-UTF-8 binary payloads still reach the JSON check and get dropped there
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Text(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))),
        Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(TransportError::Dropped(e.to_string()))),
    }
}
