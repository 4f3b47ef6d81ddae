use crate::diagnostics::DiagnosticStage;
use crate::error::{diagnostic_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::supervisor::Supervisor;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Default time allowed for the backend to answer a forwarded request
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The reverse proxy in front of the supervised process
pub struct ProxyServer {
    bind_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, supervisor, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            supervisor,
            shutdown_rx,
            pool,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr().unwrap_or(self.bind_addr);
        info!(
            addr = %addr,
            target = %self.supervisor.target(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            let pool = Arc::clone(&self.pool);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, supervisor, pool, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // Sender dropped counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let supervisor = Arc::clone(&supervisor);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, supervisor, pool, addr, request_timeout).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    supervisor: Arc<Supervisor>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
    request_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, not appended: this proxy is the first hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    match supervisor.prepare_for_request().await {
        Ok(transition) => {
            debug!(request_id, ?transition, "Backend ready");
        }
        Err(failure) => {
            error!(request_id, error = %failure.error, "Failed to prepare backend");
            return Ok(diagnostic_response(
                failure.error.code(),
                &failure.error.to_string(),
                &failure.output,
            ));
        }
    }

    let target = supervisor.target().clone();
    let result = tokio::time::timeout(request_timeout, pool.send_request(req, &target)).await;

    match result {
        Ok(Ok(response)) => {
            let stage = DiagnosticStage::new(Arc::clone(&supervisor));
            Ok(stage.finalize(response).await)
        }
        Ok(Err(e)) => {
            error!(request_id, target = %target, error = %e, "Failed to forward request via pool");
            Ok(diagnostic_response(
                ProxyErrorCode::ConnectionFailed,
                &format!("Failed to connect to backend: {}", e),
                &supervisor.take_output().await,
            ))
        }
        Err(_) => {
            warn!(
                request_id,
                target = %target,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(diagnostic_response(
                ProxyErrorCode::RequestTimeout,
                &format!("Request timed out after {} seconds", request_timeout.as_secs()),
                "",
            ))
        }
    }
}
