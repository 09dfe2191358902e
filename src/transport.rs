// Network seams: bulk snapshot fetch over HTTP and the live feed over WebSocket.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0}")]
    Other(String),
}

/// Fetches the bulk blip snapshot body from a URL.
pub trait SnapshotSource: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, TransportError>>;
}

/// Stream of text frames from one feed connection. Dropping it closes the connection.
pub type FeedStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens live feed connections.
pub trait FeedConnector: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<FeedStream, TransportError>>;
}

/// Snapshot source backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpSnapshotSource {
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl SnapshotSource for HttpSnapshotSource {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, TransportError>> {
        let request = self.client.get(url);
        async move {
            let response = request.send().await?.error_for_status()?;
            Ok(response.text().await?)
        }
        .boxed()
    }
}

/// Feed connector backed by `tokio-tungstenite`. Only text frames are forwarded; the
/// stream ends on a close frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsFeedConnector;

impl FeedConnector for WsFeedConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<FeedStream, TransportError>> {
        let url = url.to_string();
        async move {
            let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            tracing::info!(url = %url, "feed connected");
            let frames = socket
                .take_while(|frame| futures::future::ready(!matches!(frame, Ok(Message::Close(_)))))
                .filter_map(|frame| async move {
                    match frame {
                        Ok(Message::Text(text)) => Some(Ok(text)),
                        Ok(_) => None,
                        Err(e) => Some(Err(TransportError::from(e))),
                    }
                });
            Ok(frames.boxed())
        }
        .boxed()
    }
}
