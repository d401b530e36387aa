use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config,
    connect_async_tls_with_config,
};
use url::Url;

use crate::protocol::{self, PhoneMessage, ProtocolVersion};
use crate::streaming::EngineState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("connection closed")]
    Closed,
}

/// Where the pairing coordinator decided the console lives: the resolved
/// WebSocket URL, the subprotocol generation, optional trust material from
/// pairing, and the pre-accepted hole-punched socket when NAT traversal ran.
#[derive(Debug)]
pub struct ResolvedTarget {
    pub url: Url,
    pub version: ProtocolVersion,
    pub trust_pem: Option<String>,
    pub punched: Option<TcpStream>,
}

/// Open the WebSocket to the console, suspending until the handshake
/// completes. A hole-punched socket, when present, is reused as the
/// underlying transport instead of dialing out. No keepalive pings are sent
/// after the handshake.
pub async fn connect(target: ResolvedTarget) -> Result<WsStream, TransportError> {
    let request = build_request(&target)?;
    let connector = Connector::NativeTls(tls_connector(target.trust_pem.as_deref())?);

    let (stream, response) = match target.punched {
        Some(socket) => {
            client_async_tls_with_config(request, socket, None, Some(connector)).await?
        }
        None => connect_async_tls_with_config(request, None, false, Some(connector)).await?,
    };

    tracing::debug!(
        target: "disco::transport",
        url = %target.url,
        status = %response.status(),
        "websocket handshake complete"
    );
    Ok(stream)
}

fn build_request(target: &ResolvedTarget) -> Result<Request, TransportError> {
    let mut request = target.url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(target.version.subprotocol()),
    );
    Ok(request)
}

/// Console devices present self-signed or non-public-CA certificates, so
/// server validation is disabled. Trust material returned during pairing is
/// loaded opportunistically and does not gate the connection.
fn tls_connector(trust_pem: Option<&str>) -> Result<native_tls::TlsConnector, TransportError> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(true);
    builder.danger_accept_invalid_hostnames(true);
    if let Some(pem) = trust_pem {
        match native_tls::Certificate::from_pem(pem.as_bytes()) {
            Ok(cert) => {
                builder.add_root_certificate(cert);
            }
            Err(err) => {
                tracing::warn!(
                    target: "disco::transport",
                    error = %err,
                    "ignoring unusable pairing certificate"
                );
            }
        }
    }
    Ok(builder.build()?)
}

/// Serialized access to the outbound half of the socket. All writers go
/// through the one lock so frames from concurrent senders never interleave.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: PhoneMessage) -> Result<(), TransportError>;
}

pub struct WsSink {
    writer: AsyncMutex<SplitSink<WsStream, Message>>,
}

impl WsSink {
    pub fn new(writer: SplitSink<WsStream, Message>) -> Self {
        Self {
            writer: AsyncMutex::new(writer),
        }
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.close().await {
            tracing::debug!(target: "disco::transport", error = %err, "close failed");
        }
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&self, message: PhoneMessage) -> Result<(), TransportError> {
        let frame = message.encode();
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(frame)).await?;
        Ok(())
    }
}

/// Inbound receive/dispatch duty: fan each text frame out to the codec and
/// apply the result to shared engine state. Returns cleanly on peer close,
/// with an error on socket failure; either way the caller tears the session
/// down.
pub async fn receive_loop(
    reader: &mut SplitStream<WsStream>,
    engine: &EngineState,
) -> Result<(), TransportError> {
    while let Some(frame) = reader.next().await {
        match frame? {
            Message::Text(text) => {
                if let Some(message) = protocol::decode_console_frame(&text) {
                    engine.apply(message);
                }
            }
            Message::Close(_) => {
                tracing::debug!(target: "disco::transport", "console closed the session");
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}
