use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::client::StreamError;

const HANDSHAKE_PATH: &str = "socket.io/1/";
const SOCKET_PATH: &str = "/socket.io/1/websocket/";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const SOCKET_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Text line channels for one open socket.
///
/// Dropping `outgoing` closes the socket; `incoming` yields `None` once the
/// remote side is gone.
pub struct SocketChannel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Handshake and socket factory used by the stream client.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Performs the HTTP handshake and returns the session id.
    async fn handshake(&self) -> Result<String, StreamError>;

    /// Opens the socket for a session id returned by [`Connector::handshake`].
    async fn open(&self, session_id: &str) -> Result<SocketChannel, StreamError>;
}

/// Extracts the session id: the handshake body up to the first colon.
pub fn parse_session_id(body: &str) -> Result<String, StreamError> {
    let id = body.split(':').next().unwrap_or_default().trim();
    if id.is_empty() {
        return Err(StreamError::Handshake("empty session id".into()));
    }
    Ok(id.to_string())
}

/// Connector for the hosted service: `reqwest` handshake, then a
/// `tokio-tungstenite` socket pumped through a pair of channels.
#[derive(Clone)]
pub struct WebSocketConnector {
    http: reqwest::Client,
    base_url: Url,
}

impl WebSocketConnector {
    pub fn new(base_url: &str) -> Result<Self, StreamError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| StreamError::Setup(format!("invalid base url {base_url}: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| StreamError::Setup(format!("http client: {err}")))?;
        Ok(Self { http, base_url })
    }

    pub fn handshake_url(&self, cache_buster: u128) -> Result<Url, StreamError> {
        let mut url = self
            .base_url
            .join(HANDSHAKE_PATH)
            .map_err(|err| StreamError::Setup(format!("handshake url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("t", &cache_buster.to_string());
        Ok(url)
    }

    pub fn socket_url(&self, session_id: &str) -> Result<Url, StreamError> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(StreamError::Setup(format!(
                    "unsupported base url scheme {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| StreamError::Setup(format!("cannot switch scheme to {scheme}")))?;
        url.set_path(&format!("{SOCKET_PATH}{session_id}"));
        url.set_query(None);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn handshake(&self) -> Result<String, StreamError> {
        let cache_buster = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let url = self.handshake_url(cache_buster)?;
        tracing::debug!(target = "stream", url = %url, "starting handshake");
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| StreamError::Handshake(err.to_string()))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|err| StreamError::Handshake(err.to_string()))?;
        if !status.is_success() {
            return Err(StreamError::Handshake(format!(
                "unexpected status {status}: {body}"
            )));
        }
        parse_session_id(&body)
    }

    async fn open(&self, session_id: &str) -> Result<SocketChannel, StreamError> {
        let url = self.socket_url(session_id)?;
        let (ws_stream, _) = tokio::time::timeout(SOCKET_OPEN_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| StreamError::Transport("websocket connect timed out".into()))?
            .map_err(|err| StreamError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "stream", url = %url, "websocket connected");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<String>();
        tokio::spawn(pump_websocket(ws_stream, rx_out, tx_in));

        Ok(SocketChannel {
            outgoing: tx_out,
            incoming: rx_in,
        })
    }
}

async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<String>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    loop {
        tokio::select! {
            outgoing = rx_out.recv() => match outgoing {
                Some(text) => {
                    if let Err(err) = ws_sender.send(Message::Text(text)).await {
                        tracing::warn!(target = "stream", error = %err, "websocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.close().await;
                    break;
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if tx_in.send(text).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if tx_in.send(text).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "stream", error = %err, "dropping non-utf8 binary message");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match err {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            tracing::debug!(target = "stream", "websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "stream", "websocket error: {err}");
                        }
                    }
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_text_before_first_colon() {
        assert_eq!(
            parse_session_id("abc123:60:60:websocket,xhr-polling").unwrap(),
            "abc123"
        );
        assert_eq!(parse_session_id("solo").unwrap(), "solo");
        assert!(matches!(
            parse_session_id(":60:60"),
            Err(StreamError::Handshake(_))
        ));
    }

    #[test]
    fn builds_handshake_url_with_cache_buster() {
        let connector = WebSocketConnector::new("https://trello.com").unwrap();
        let url = connector.handshake_url(1234).unwrap();
        assert_eq!(url.as_str(), "https://trello.com/socket.io/1/?t=1234");
    }

    #[test]
    fn builds_socket_url_from_base() {
        let connector = WebSocketConnector::new("https://trello.com").unwrap();
        let url = connector.socket_url("sid42").unwrap();
        assert_eq!(url.as_str(), "wss://trello.com/socket.io/1/websocket/sid42");

        let local = WebSocketConnector::new("http://127.0.0.1:8080/").unwrap();
        let url = local.socket_url("x").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/socket.io/1/websocket/x");
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let connector = WebSocketConnector::new("ftp://example.com").unwrap();
        assert!(matches!(
            connector.socket_url("x"),
            Err(StreamError::Setup(_))
        ));
    }
}
