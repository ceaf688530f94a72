//! WebSocket transport over tokio-tungstenite

use super::transport::{Connector, Frame, StreamSession};
use crate::errors::ConnectionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

/// Dials `url` on every connect.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, ConnectionError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        Ok(Box::new(WsSession { stream }))
    }
}

pub struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamSession for WsSession {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(bytes) => Message::binary(bytes),
            Frame::Ping(payload) => Message::Ping(payload.into()),
            Frame::Pong(payload) => Message::Pong(payload.into()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ConnectionError::Transport(e.to_string()))),
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                Message::Pong(payload) => Frame::Pong(payload.to_vec()),
                // tungstenite queues the pong itself
                Message::Ping(_) | Message::Frame(_) => continue,
                Message::Close(_) => return None,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
