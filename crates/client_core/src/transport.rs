use anyhow::{anyhow, Context, Result};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use shared::{
    domain::UserId,
    protocol::{ClientFrame, ServerFrame},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid server frame: {0}")]
    InvalidFrame(#[source] serde_json::Error),
    #[error("websocket transport failed: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Typed frame channel to the server. Identifies itself on connect, so the
/// first thing the server ever sees from us is the `register` frame.
pub struct EventChannel {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

impl EventChannel {
    pub async fn connect(server_url: &str, identity: UserId) -> Result<Self> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_url = format!("{}/ws", ws_url.trim_end_matches('/'));
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (writer, reader) = ws_stream.split();
        let mut channel = Self { writer, reader };
        channel
            .send(&ClientFrame::Register { identity })
            .await
            .context("failed to register identity")?;
        Ok(channel)
    }

    pub async fn send(&mut self, frame: &ClientFrame) -> Result<(), ChannelError> {
        let text = serde_json::to_string(frame).map_err(ChannelError::InvalidFrame)?;
        self.writer.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next server frame, or `None` once the channel is gone. Unparseable
    /// frames are logged and skipped rather than tearing the channel down.
    pub async fn next(&mut self) -> Option<Result<ServerFrame, ChannelError>> {
        loop {
            match self.reader.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => return Some(Ok(frame)),
                    Err(error) => {
                        warn!(%error, "skipping malformed server frame");
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(error) => return Some(Err(error.into())),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ChannelError> {
        self.writer.send(Message::Close(None)).await?;
        Ok(())
    }
}
