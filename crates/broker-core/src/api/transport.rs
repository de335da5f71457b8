//! Transport seam between the session and the broker.

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::{Error, Result};

/// Outbound half of a connection: accepts text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of a connection: yields text frames until the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens fresh connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)>;
}

/// WebSocket connector for the live broker.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    /// `endpoint` is the full URL including the `app_id` query parameter.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)> {
        let (ws_stream, _) = connect_async(self.endpoint.as_str()).await?;
        info!(endpoint = %self.endpoint, "WebSocket connected");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(Error::from)
            .with(|frame: String| future::ready(Ok::<_, Error>(Message::Text(frame))));

        // Control frames are answered by tungstenite itself; only text frames
        // reach the session.
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => Some(Err(Error::Connection {
                    message: format!("closed by server: {:?}", frame),
                })),
                Ok(other) => {
                    debug!(kind = ?other, "Ignoring non-text frame");
                    None
                }
                Err(e) => Some(Err(Error::from(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
