//! Minimal WebSocket test client for the v1 protocol.
//!
//! Carries the bearer token as the second subprotocol token, the way the
//! browser extension does.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;
use wv_protocol::{ClientMessage, ServerMessage, SUBPROTOCOL};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WsTestClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl WsTestClient {
    /// Connect with `Sec-WebSocket-Protocol: webverse-v1, <token>`.
    pub async fn connect(url: &str, token: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Self::connect_with(url, token, &[]).await
    }

    /// Connect with extra request headers (e.g. `Origin`).
    pub async fn connect_with(
        url: &str,
        token: &str,
        headers: &[(&str, &str)],
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let uri: tokio_tungstenite::tungstenite::http::Uri = url.parse()?;
        let host = uri.host().unwrap_or("localhost").to_owned();
        let host_header = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let mut builder = Request::builder()
            .uri(url)
            .header("Host", host_header)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Sec-WebSocket-Protocol", format!("{SUBPROTOCOL}, {token}"));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(())?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(msg)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send a raw text frame, for malformed-input tests.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Next protocol message, skipping transport frames.  Errors on close
    /// or timeout.
    pub async fn recv(&mut self) -> Result<ServerMessage, Box<dyn std::error::Error>> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| "timed out waiting for a server message")?;
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let msg: ServerMessage = serde_json::from_str(text.as_str())?;
                    return Ok(msg);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return Err(format!("closed by server: {frame:?}").into());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Wait for the server to close or drop the socket.  Returns the close
    /// reason text when one was sent.
    pub async fn recv_close(&mut self) -> Result<Option<String>, Box<dyn std::error::Error>> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| "timed out waiting for close")?;
            match frame {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map(|f| f.reason.to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(None),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
