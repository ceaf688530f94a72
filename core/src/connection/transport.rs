//! Transport seam between the connection manager and a concrete socket

use crate::errors::ConnectionError;
use async_trait::async_trait;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }
}

/// An established stream.
#[async_trait]
pub trait StreamSession: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError>;

    /// Next inbound frame. `None` means the peer closed the stream.
    ///
    /// Must be cancel safe: the manager races it against timers and commands.
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>>;

    async fn close(&mut self);
}

/// Opens sessions. Called once per connect and once per reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, ConnectionError>;
}
