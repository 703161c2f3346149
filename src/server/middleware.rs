//! Request signature verification and response signing.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use super::error::AppError;
use super::AppState;
use crate::error::ValidationError;
use crate::signing::Signer;
use crate::SIGNATURE_HEADER;

/// Largest request or response body buffered for signing
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

fn signature_header() -> HeaderName {
    HeaderName::from_static("hashsha256")
}

/// Buffers the (already decompressed) request body. When a key is set and
/// the request carries `HashSHA256`, the body must match it; the response
/// body is then signed into the same header.
pub(crate) async fn verify_and_sign(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return AppError::from(ValidationError::malformed(format!("unreadable body: {e}"))).into_response();
        }
    };

    if let (Some(signer), Some(header)) = (state.signer.as_ref(), parts.headers.get(SIGNATURE_HEADER)) {
        let valid = header.to_str().map(|signature| signer.verify(&bytes, signature)).unwrap_or(false);
        if !valid {
            warn!(target: "relay::server", uri = %parts.uri, "Request signature mismatch");
            return AppError::InvalidSignature.into_response();
        }
    }

    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    match state.signer.as_ref() {
        Some(signer) => sign_response(signer, response).await,
        None => response,
    }
}

async fn sign_response(signer: &Signer, response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(target: "relay::server", error = %e, "Failed to buffer response for signing");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Ok(value) = HeaderValue::from_str(&signer.sign(&bytes)) {
        parts.headers.insert(signature_header(), value);
    }
    Response::from_parts(parts, Body::from(bytes))
}
