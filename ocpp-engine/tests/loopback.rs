//! Central system and charge point talking over a loopback WebSocket

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ocpp_engine::{
    connect, reference_router, serve, BootHandshakeRequest, BootReason, CentralConfig,
    ChargePointConfig, ConnectorStatus, EngineConfig, ErrorCode, KeepAliveState,
    MessageIdStrategy, OcppError, RegistrationStatus, SessionState, StatusReportRequest,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

async fn start_central(config: CentralConfig) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ocpp", listener.local_addr().unwrap());
    let router = Arc::new(reference_router(&config).unwrap());

    let server = tokio::spawn(async move {
        let _ = serve(listener, router, config).await;
    });
    (url, server)
}

fn boot_request(vendor: &str) -> BootHandshakeRequest {
    BootHandshakeRequest {
        model: "someModel".into(),
        vendor_name: vendor.into(),
        reason: BootReason::Unknown,
    }
}

async fn wait_for_keep_alive(
    session: &ocpp_engine::ClientSession,
    expected: KeepAliveState,
) -> bool {
    for _ in 0..100 {
        if session.keep_alive_state() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_boot_status_and_keep_alive() {
    let (url, server) = start_central(CentralConfig::default()).await;

    let config = ChargePointConfig::new(url, "CP1111")
        .with_vendor_tag("CP1111")
        .with_engine(EngineConfig::default().with_message_ids(MessageIdStrategy::Sequential));
    let link = connect(&config).await.unwrap();
    let session = link.session.clone();
    assert_eq!(session.state(), SessionState::Connected);

    let boot = session.boot(&boot_request("someVendor")).await.unwrap();
    assert_eq!(boot.status, RegistrationStatus::Accepted);
    assert_eq!(boot.keep_alive_interval_seconds, 3);
    assert_eq!(session.state(), SessionState::Active);
    assert!(wait_for_keep_alive(&session, KeepAliveState::Running).await);

    let ack = session
        .status_report(&StatusReportRequest {
            timestamp: Utc::now(),
            connector_status: ConnectorStatus::Available,
            evse_id: 1,
            connector_id: 1,
        })
        .await
        .unwrap();
    assert_eq!(serde_json::to_value(ack).unwrap(), json!({}));

    match session.call("Foo", json!({})).await {
        Err(OcppError::RemoteError { code, .. }) => assert_eq!(code, ErrorCode::NotImplemented),
        other => panic!("Expected NotImplemented, got {:?}", other),
    }

    drop(session);
    let session = link.session.clone();
    link.shutdown("test over").await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.keep_alive_state(), KeepAliveState::Cancelled);

    server.abort();
}

#[tokio::test]
async fn test_rejected_vendor_keeps_keep_alive_idle() {
    let (url, server) = start_central(CentralConfig::default().with_accepted_vendor("trusted")).await;

    let link = connect(&ChargePointConfig::new(url, "CP2222")).await.unwrap();

    let boot = link.session.boot(&boot_request("stranger")).await.unwrap();
    assert_eq!(boot.status, RegistrationStatus::Rejected);
    assert_eq!(link.session.state(), SessionState::Rejected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(link.session.keep_alive_state(), KeepAliveState::Idle);

    link.shutdown("test over").await;
    server.abort();
}

#[tokio::test]
async fn test_peer_close_fails_pending_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    // Reads one frame, then hangs up without answering
    let server = tokio::spawn(async move {
        use futures_util::StreamExt;

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        let _ = ws.close(None).await;
    });

    let link = connect(&ChargePointConfig::new(url, "CP3333")).await.unwrap();
    let result = link.session.call("StatusReport", json!({})).await;
    assert!(matches!(result, Err(OcppError::ConnectionClosed)));

    tokio::time::timeout(Duration::from_secs(5), link.session.closed())
        .await
        .unwrap();
    assert_eq!(link.session.correlator().pending_count(), 0);

    server.await.unwrap();
}

#[tokio::test]
async fn test_oversized_message_drops_link() {
    let (url, server) = start_central(CentralConfig::default()).await;
    let link = connect(&ChargePointConfig::new(url, "CP4444")).await.unwrap();

    // Well-formed KeepAlive, just larger than the central system will read
    let vendor_id = "x".repeat(ocpp_engine::transport::MAX_MESSAGE_SIZE + 1);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        link.session
            .call("KeepAlive", json!({"customData": {"vendorId": vendor_id}})),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(OcppError::ConnectionClosed)));

    tokio::time::timeout(Duration::from_secs(5), link.session.closed())
        .await
        .unwrap();
    server.abort();
}
