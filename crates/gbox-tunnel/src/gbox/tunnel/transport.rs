use std::{pin::Pin, time::Duration};

use anyhow::Context;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{WebSocketStream, tungstenite};

pub use tungstenite::Message;

pub type WsError = tungstenite::Error;

/// Write half of a tunnel socket. Only the multiplexer's frame sender touches it.
pub type BoxedSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of a tunnel socket. Consumed by exactly one reader loop.
pub type BoxedSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

pub struct WsTransport {
    pub sink: BoxedSink,
    pub source: BoxedSource,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish_non_exhaustive()
    }
}

/// Splits any WebSocket stream into type-erased halves, so the multiplexer does not care
/// whether it runs over TLS, plain TCP, or an in-memory pipe.
pub fn from_stream<S>(ws: WebSocketStream<S>) -> WsTransport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = ws.split();
    WsTransport {
        sink: Box::pin(sink),
        source: Box::pin(source),
    }
}

/// Dials a `ws://` or `wss://` URL. TLS comes from the WebSocket library; nothing is layered
/// on top.
pub async fn connect(url: &str, dial_timeout: Duration) -> anyhow::Result<WsTransport> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("tunnel: invalid websocket url {}", redact_url(url)))?;

    let dial = tokio_tungstenite::connect_async(request);
    let (ws, _resp) = tokio::time::timeout(dial_timeout, dial)
        .await
        .with_context(|| {
            format!(
                "tunnel: websocket dial timed out after {}",
                humantime::format_duration(dial_timeout)
            )
        })?
        .context("tunnel: websocket dial failed")?;

    Ok(from_stream(ws))
}

/// Strips the query string, which carries the one-time tunnel token.
pub fn redact_url(url: &str) -> &str {
    match url.find('?') {
        Some(i) => &url[..i],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_url_drops_query() {
        assert_eq!(
            redact_url("wss://t.example.com/tunnel?token=secret"),
            "wss://t.example.com/tunnel"
        );
        assert_eq!(redact_url("ws://127.0.0.1:1/x"), "ws://127.0.0.1:1/x");
    }

    #[tokio::test]
    async fn connect_rejects_non_websocket_url() {
        let err = connect("not a url", Duration::from_secs(1)).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid websocket url"));
    }

    #[tokio::test]
    async fn connect_reports_refused_dial() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let err = connect(&format!("ws://{addr}/"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("websocket dial failed"));
    }
}
