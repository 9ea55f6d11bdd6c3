//! Streaming channel seam and its WebSocket implementation.

use crate::{error::TelemetryError, session::Credential};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::debug;

/// Transport-neutral frame exchanged over a [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Pong,
    Close,
}

/// One live bidirectional message channel.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TelemetryError>;

    /// Next inbound frame, `None` once the channel has ended.
    async fn recv(&mut self) -> Option<Result<Frame, TelemetryError>>;

    async fn close(&mut self) -> Result<(), TelemetryError>;
}

/// Opens channels. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, credential: Option<&Credential>) -> Result<Box<dyn Channel>, TelemetryError>;
}

/// Connects to the backend telemetry WebSocket, e.g. `ws://127.0.0.1:8000/ws/telemetry`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, credential: Option<&Credential>) -> Result<Box<dyn Channel>, TelemetryError> {
        let mut request = self.url.as_str().into_client_request()?;

        if let Some(credential) = credential {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
                .map_err(|error| TelemetryError::Protocol(format!("invalid bearer header: {error}")))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }

        let (stream, response) = connect_async(request).await?;
        debug!(status = %response.status(), "telemetry handshake complete");

        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, frame: Frame) -> Result<(), TelemetryError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping => Message::Ping(Vec::new().into()),
            Frame::Pong => Message::Pong(Vec::new().into()),
            Frame::Close => Message::Close(None),
        };
        self.stream.send(message).await.map_err(TelemetryError::from)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TelemetryError>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(Message::Text(text)) => Ok(Frame::Text(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Ok(Frame::Text(text)),
                    Err(error) => Err(TelemetryError::Protocol(format!("non utf-8 binary frame: {error}"))),
                },
                Ok(Message::Ping(_)) => Ok(Frame::Ping),
                Ok(Message::Pong(_)) => Ok(Frame::Pong),
                Ok(Message::Close(_)) => Ok(Frame::Close),
                // Raw frames are never surfaced while reading
                Ok(_) => continue,
                Err(error) => Err(TelemetryError::from(error)),
            };
            return Some(frame);
        }
    }

    async fn close(&mut self) -> Result<(), TelemetryError> {
        self.stream.close(None).await.map_err(TelemetryError::from)
    }
}
