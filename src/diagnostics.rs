//! Response stage that appends captured process output to server errors
//!
//! Runs on every forwarded response. Anything below 500 passes through
//! untouched and streaming; a 5xx response is buffered so the output can be
//! written after the backend's own body. Buffering is capped at the capture
//! bound: a larger error body is passed through without diagnostics.

use crate::error::{diagnostic_response, ProxyErrorCode};
use crate::supervisor::Supervisor;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::Response;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct DiagnosticStage {
    supervisor: Arc<Supervisor>,
    max_body_bytes: usize,
}

impl DiagnosticStage {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let max_body_bytes = supervisor.output().capacity();
        Self {
            supervisor,
            max_body_bytes,
        }
    }

    /// Largest backend error body that will be buffered (builder pattern)
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub async fn finalize(
        &self,
        response: Response<BoxBody<Bytes, hyper::Error>>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if !response.status().is_server_error() {
            return response;
        }

        if response.body().size_hint().lower() > self.max_body_bytes as u64 {
            debug!(
                status = %response.status(),
                max_body_bytes = self.max_body_bytes,
                "Error body too large to annotate"
            );
            return response;
        }

        let output = self.supervisor.take_output().await;
        if output.is_empty() {
            return response;
        }

        let (mut parts, body) = response.into_parts();
        let collected = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(status = %parts.status, error = %e, "Failed to read backend error body");
                return diagnostic_response(
                    ProxyErrorCode::ConnectionFailed,
                    &format!("Failed to read backend response: {}", e),
                    &output,
                );
            }
        };

        debug!(status = %parts.status, appended = output.len(), "Appending process output to error response");

        let mut body = Vec::with_capacity(collected.len() + output.len());
        body.extend_from_slice(&collected);
        body.extend_from_slice(output.as_bytes());

        // Length changed; hyper recomputes it from the full body
        parts.headers.remove(CONTENT_LENGTH);
        parts.headers.remove(TRANSFER_ENCODING);

        Response::from_parts(
            parts,
            Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed(),
        )
    }
}
