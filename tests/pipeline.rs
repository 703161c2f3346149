//! Agent transport against the real server router over a local socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use metrics_relay::agent::{HttpTransport, Transport, TransportConfig};
use metrics_relay::engine::UpdateEngine;
use metrics_relay::error::TransportError;
use metrics_relay::model::{Metric, MetricKind};
use metrics_relay::server::{router, AppState};
use metrics_relay::signing::Signer;
use metrics_relay::storage::Backend;

struct TestServer {
    address: SocketAddr,
    engine: Arc<UpdateEngine>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(key: &str) -> Self {
        let engine = Arc::new(UpdateEngine::from_backend(&Backend::memory(), Span::none()));
        let app = router(AppState::new(engine.clone(), Signer::from_key(key)), Span::none());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let token = CancellationToken::new();
        let shutdown = token.clone().cancelled_owned();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).with_graceful_shutdown(shutdown).await.unwrap();
        });
        Self { address, engine, token, handle }
    }

    fn transport(&self, key: &str) -> HttpTransport {
        HttpTransport::new(TransportConfig {
            address: self.address.to_string(),
            signer: Signer::from_key(key),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn signed_batch_is_accumulated() {
    let server = TestServer::start("secret").await;
    let transport = server.transport("secret");

    let batch = vec![Metric::counter("PollCount", 1), Metric::gauge("RandomValue", 0.5)];
    transport.send_batch(&batch).await.unwrap();
    transport.send_batch(&batch).await.unwrap();

    let poll_count = server.engine.get(MetricKind::Counter, "PollCount").await.unwrap();
    assert_eq!(poll_count.delta, Some(2));
    let random = server.engine.get(MetricKind::Gauge, "RandomValue").await.unwrap();
    assert_eq!(random.value, Some(0.5));

    server.stop().await;
}

#[tokio::test]
async fn wrong_key_is_rejected_without_retry() {
    let server = TestServer::start("secret").await;
    let transport = server.transport("other");

    let err = transport.send_batch(&[Metric::counter("hits", 1)]).await.unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 400 }), "{err}");
    assert!(!err.is_retriable());
    assert!(server.engine.list().await.unwrap().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn legacy_path_updates_and_value_lookup() {
    let server = TestServer::start("").await;
    let transport = server.transport("");

    transport.send_single(&Metric::counter("hits", 10)).await.unwrap();
    transport.send_single(&Metric::counter("hits", 5)).await.unwrap();
    transport.send_single(&Metric::gauge("temp", 36.6)).await.unwrap();

    let body = reqwest::get(format!("http://{}/value/counter/hits", server.address))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "15");

    let html = reqwest::get(format!("http://{}/", server.address)).await.unwrap().text().await.unwrap();
    assert!(html.contains("temp"));
    assert!(html.contains("36.6"));

    server.stop().await;
}
