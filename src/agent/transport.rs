//! Wire encoding and HTTP delivery of metric batches.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Response, StatusCode};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::model::Metric;
use crate::signing::Signer;
use crate::SIGNATURE_HEADER;

/// Delivery of metrics to the server. Each call is one all-or-nothing unit
/// for the retry policy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_batch(&self, batch: &[Metric]) -> TransportResult<()>;

    async fn send_single(&self, metric: &Metric) -> TransportResult<()>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub address: String,
    pub signer: Option<Signer>,
    pub timeout: Duration,
}

/// Encoded `/updates/` request body
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// Gzip-compressed JSON array
    pub body: Vec<u8>,
    /// Hex HMAC-SHA256 of the uncompressed JSON
    pub signature: Option<String>,
}

/// JSON, then gzip; the signature covers the JSON before compression.
pub fn encode_batch(batch: &[Metric], signer: Option<&Signer>) -> TransportResult<EncodedBatch> {
    let json = serde_json::to_vec(batch)?;
    let signature = signer.map(|s| s.sign(&json));
    let body = gzip(&json).map_err(TransportError::Compress)?;
    Ok(EncodedBatch { body, signature })
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Prefix `http://` when no scheme is given; drop trailing slashes.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

fn check_status(response: &Response) -> TransportResult<()> {
    match response.status() {
        StatusCode::OK => Ok(()),
        status => Err(TransportError::Status { status: status.as_u16() }),
    }
}

// ============================================================================
// HTTP TRANSPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
    base_url: String,
    signer: Option<Signer>,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { client, base_url: normalize_address(&config.address), signer: config.signer })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, batch: &[Metric]) -> TransportResult<()> {
        let encoded = encode_batch(batch, self.signer.as_ref())?;
        let body_len = encoded.body.len();

        let mut request = self
            .client
            .post(format!("{}/updates/", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip");
        if let Some(signature) = encoded.signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(encoded.body).send().await?;
        check_status(&response)?;

        debug!(target: "relay::agent", metrics = batch.len(), bytes = body_len, "Batch delivered");
        Ok(())
    }

    async fn send_single(&self, metric: &Metric) -> TransportResult<()> {
        let url = format!(
            "{}/update/{}/{}/{}",
            self.base_url,
            metric.kind(),
            metric.name(),
            metric.render_value()
        );
        let response = self.client.post(url).header(CONTENT_TYPE, "text/plain").send().await?;
        check_status(&response)
    }
}
