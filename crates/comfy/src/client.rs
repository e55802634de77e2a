//! WebSocket client for a ComfyUI server.
//!
//! [`ComfyClient`] holds connection configuration; [`ComfyClient::connect`]
//! establishes a live [`ComfyConnection`] whose `client_id` lets ComfyUI
//! address execution messages back to this specific consumer.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Connection configuration for one ComfyUI server.
pub struct ComfyClient {
    ws_url: String,
    api_url: String,
}

/// A live WebSocket connection to a ComfyUI server.
pub struct ComfyConnection {
    /// Unique client ID sent during the handshake and echoed on the
    /// HTTP submit so messages correlate to this connection.
    pub client_id: String,
    /// Base HTTP API URL (e.g. `http://host:8188`).
    pub api_url: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ComfyClient {
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(ws_url: String, api_url: String) -> Self {
        Self { ws_url, api_url }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Connect to the ComfyUI WebSocket endpoint with a fresh client id.
    pub async fn connect(&self) -> Result<ComfyConnection, ComfyClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/ws?clientId={client_id}", self.ws_url);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyClientError::Connection(format!(
                "failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, url = %self.ws_url, "Connected to ComfyUI");

        Ok(ComfyConnection {
            client_id,
            api_url: self.api_url.clone(),
            ws_stream,
        })
    }
}

/// Errors from the WebSocket client layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an established connection.
    #[error("protocol error: {0}")]
    Protocol(String),
}
