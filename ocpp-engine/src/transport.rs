//! WebSocket binding
//!
//! Thin layer over tokio-tungstenite. The central system accepts stations on any
//! path and takes the last path segment as the station id; the charge point opens
//! `<csms_url>/<station_id>`. Both sides negotiate the OCPP 2.0.1 subprotocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::ready;
use futures_util::{stream, Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Error as WsError, Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::config::{CentralConfig, ChargePointConfig};
use crate::error::OcppError;
use crate::ocpp::KeepAliveRequest;
use crate::rpc::Router;
use crate::session::{ClientSession, ServerSession, TransportEvent};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Largest inbound message either side accepts
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest inbound frame either side accepts
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Socket limits shared by server and client
fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

/// Accept stations forever, one server session task per connection
pub async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    config: CentralConfig,
) -> Result<(), OcppError> {
    info!("Central system listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        let router = router.clone();
        let buffer = config.outbound_buffer;

        tokio::spawn(async move {
            if let Err(e) = accept_station(stream, peer, router, buffer).await {
                warn!(%peer, "Connection failed: {}", e);
            }
        });
    }
}

async fn accept_station(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    buffer: usize,
) -> Result<(), OcppError> {
    let mut station_id = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        station_id = station_from_path(request.uri().path());

        let offers_ocpp = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|offered| offered.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL));
        if offers_ocpp {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(OCPP_SUBPROTOCOL),
            );
        }
        Ok(response)
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config())).await?;

    let station = match station_id {
        Some(id) => id,
        None => {
            warn!(%peer, "No station id in request path, using peer address");
            peer.to_string()
        }
    };
    info!(%peer, station = %station, "Station connected");

    let (sink, source) = ws.split();
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let writer = tokio::spawn(write_frames(station.clone(), sink, rx));

    let session = ServerSession::new(station.clone(), router, tx);
    session.run(inbound_events(source)).await;

    // The session and its sender are gone, so the writer drains and closes
    let _ = writer.await;
    info!(station = %station, "Station disconnected");
    Ok(())
}

/// A charge-point link: the running session plus its socket tasks
pub struct ClientConnection {
    pub session: Arc<ClientSession>,
    pub reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Close the session, stop reading and give the writer a moment to send the close frame
    pub async fn shutdown(self, reason: &str) {
        let Self {
            session,
            reader,
            writer,
        } = self;

        session.close(reason);
        reader.abort();
        let _ = reader.await;
        drop(session);

        if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("Writer still busy after shutdown, dropping it");
        }
    }
}

/// Connect to the central system and start the session
pub async fn connect(config: &ChargePointConfig) -> Result<ClientConnection, OcppError> {
    let url = build_ocpp_url(&config.csms_url, &config.station_id);
    info!("Connecting to CSMS: {}", url);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|_| OcppError::InvalidUrl(url.clone()))?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OCPP_SUBPROTOCOL),
    );

    let (ws, response) = connect_async_with_config(request, Some(ws_config()), false)
        .await
        .map_err(|e| {
            error!("WebSocket connection failed: {}", e);
            e
        })?;

    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
        warn!(
            "CSMS did not accept OCPP 2.0.1 subprotocol, got: {:?}",
            accepted_protocol
        );
    }
    info!("WebSocket connected to {}", url);

    let (sink, source) = ws.split();
    let (tx, rx) = mpsc::channel(config.engine.outbound_buffer.max(1));
    let writer = tokio::spawn(write_frames(config.station_id.clone(), sink, rx));

    let session = Arc::new(
        ClientSession::new(config.station_id.clone(), tx, config.engine.clone())
            .with_keep_alive_request(&KeepAliveRequest::tagged(config.vendor_tag.clone()))?,
    );

    let reader = {
        let session = session.clone();
        tokio::spawn(async move { session.run(inbound_events(source)).await })
    };

    Ok(ClientConnection {
        session,
        reader,
        writer,
    })
}

/// Drain a session's outbound queue into text frames
async fn write_frames<S>(session: String, mut sink: S, mut outbound: mpsc::Receiver<Vec<u8>>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                error!(session = %session, "Dropping non UTF-8 frame: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text)).await {
            error!(session = %session, "Failed to send WebSocket message: {}", e);
            return;
        }
    }

    let _ = sink.close().await;
}

/// Socket messages as session events. End of stream reads as a close.
fn inbound_events<S>(source: S) -> impl Stream<Item = TransportEvent> + Unpin
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    source
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Text(text)) => Some(TransportEvent::Frame(text.into_bytes())),
                Ok(Message::Binary(data)) => Some(TransportEvent::Frame(data)),
                Ok(Message::Close(_)) => Some(TransportEvent::Closed),
                // Ping/pong are answered by tungstenite
                Ok(_) => None,
                Err(e) => Some(TransportEvent::Error(e.to_string())),
            })
        })
        .chain(stream::once(ready(TransportEvent::Closed)))
}

/// Last non-empty path segment, e.g. `/ocpp/CP1111` -> `CP1111`
pub fn station_from_path(path: &str) -> Option<String> {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ocpp_url() {
        assert_eq!(
            build_ocpp_url("ws://localhost:9000", "CP1111"),
            "ws://localhost:9000/CP1111"
        );
        assert_eq!(
            build_ocpp_url("ws://localhost:9000/ocpp/", "CP1111"),
            "ws://localhost:9000/ocpp/CP1111"
        );
    }

    #[test]
    fn test_ws_limits() {
        let config = ws_config();
        assert_eq!(config.max_message_size, Some(64 * 1024));
        assert_eq!(config.max_frame_size, Some(16 * 1024));
    }

    #[test]
    fn test_station_from_path() {
        assert_eq!(station_from_path("/CP1111"), Some("CP1111".to_string()));
        assert_eq!(station_from_path("/ocpp/CP1111/"), Some("CP1111".to_string()));
        assert_eq!(station_from_path("/"), None);
        assert_eq!(station_from_path(""), None);
    }

    #[tokio::test]
    async fn test_inbound_events_mapping() {
        let source = stream::iter(vec![
            Ok(Message::Text("[2,\"1\",\"KeepAlive\",{}]".to_string())),
            Ok(Message::Ping(vec![1])),
            Ok(Message::Binary(b"[3,\"1\",{}]".to_vec())),
            Err(WsError::ConnectionClosed),
        ]);

        let events: Vec<_> = inbound_events(source).collect().await;
        assert_eq!(
            events,
            vec![
                TransportEvent::Frame(b"[2,\"1\",\"KeepAlive\",{}]".to_vec()),
                TransportEvent::Frame(b"[3,\"1\",{}]".to_vec()),
                TransportEvent::Error(WsError::ConnectionClosed.to_string()),
                TransportEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ChargePointConfig::new(format!("ws://{}", addr), "CP1111");
        assert!(connect(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let config = ChargePointConfig::new("not a url", "CP1111");
        assert!(matches!(
            connect(&config).await,
            Err(OcppError::InvalidUrl(_))
        ));
    }
}
