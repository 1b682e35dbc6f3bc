use axum::extract::ws::{self, WebSocket};
use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};

/// Exposes an accepted WebSocket as the byte stream the tunnel engine
/// consumes.
pub fn websocket_compat(ws: WebSocket) -> impl AsyncRead + AsyncWrite + Unpin + Send + 'static {
    let ws_compat = ws
        .map(|item| {
            item.map(|msg| match msg {
                ws::Message::Text(s) => transport::WsReadMsg::Payload(Bytes::copy_from_slice(s.as_bytes())),
                ws::Message::Binary(data) => transport::WsReadMsg::Payload(data),
                ws::Message::Ping(_) | ws::Message::Pong(_) => transport::WsReadMsg::Ignored,
                ws::Message::Close(_) => transport::WsReadMsg::Close,
            })
        })
        .with(|item: Bytes| futures::future::ready(Ok::<_, axum::Error>(ws::Message::Binary(item))));

    transport::WsStream::new(ws_compat)
}
