//! Readiness polling after a (re)start
//!
//! Any HTTP response counts as "up", whatever its status: the question is only
//! whether something is listening on the target address yet.

use crate::config::ReadinessConfig;
use crate::error::SupervisorError;
use crate::process::{Liveness, ProcessHandle};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ReadinessPoller {
    client: Client<HttpConnector, Empty<Bytes>>,
    target: Uri,
    interval: Duration,
    max_attempts: u32,
    probe_timeout: Duration,
}

impl ReadinessPoller {
    pub fn new(target: Uri, config: &ReadinessConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(config.probe_timeout()));

        // Probes never reuse connections: a pooled connection to a dead
        // process must not make the next generation look reachable
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            target,
            interval: config.interval(),
            max_attempts: config.max_attempts,
            probe_timeout: config.probe_timeout(),
        }
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    /// Send one HEAD request. True if any response arrived.
    pub async fn probe(&self) -> bool {
        let req = match Request::builder()
            .method(Method::HEAD)
            .uri(self.target.clone())
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.probe_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                debug!(status = %response.status(), "Readiness probe answered");
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Readiness probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis(), "Readiness probe timed out");
                false
            }
        }
    }

    /// Upper bound on the whole wait: every interval, plus room for the
    /// final probe (capped at one interval)
    pub fn deadline(&self) -> Duration {
        self.interval * self.max_attempts + self.probe_timeout.min(self.interval)
    }

    /// Poll until the target answers, the process exits, or the deadline passes
    pub async fn wait_until_up(&self, process: &ProcessHandle) -> Result<(), SupervisorError> {
        if !process.is_running() {
            return Err(SupervisorError::NotRunning);
        }

        info!(pid = process.pid(), target = %self.target, "Waiting for process...");

        let result = match tokio::time::timeout(self.deadline(), self.poll(process)).await {
            Ok(result) => result,
            Err(_) if !process.is_running() => Err(exited_error(process.liveness())),
            Err(_) => Err(self.timeout_error()),
        };

        if let Err(SupervisorError::ReadinessTimeout { .. }) = result {
            warn!(
                pid = process.pid(),
                attempts = self.max_attempts,
                interval_ms = self.interval.as_millis(),
                "Giving up"
            );
        }
        result
    }

    async fn poll(&self, process: &ProcessHandle) -> Result<(), SupervisorError> {
        for attempt in 1..=self.max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                liveness = process.exited() => {
                    warn!(pid = process.pid(), ?liveness, "Process exited while waiting for it to listen");
                    return Err(exited_error(liveness));
                }
            }

            if self.probe().await {
                info!(pid = process.pid(), attempt, "Process is up");
                return Ok(());
            }

            // The probe may have raced with the exit
            if !process.is_running() {
                return Err(exited_error(process.liveness()));
            }

            debug!(pid = process.pid(), attempt, max_attempts = self.max_attempts, "Not listening yet");
        }

        Err(self.timeout_error())
    }

    fn timeout_error(&self) -> SupervisorError {
        SupervisorError::ReadinessTimeout {
            attempts: self.max_attempts,
            interval: self.interval,
        }
    }
}

fn exited_error(liveness: Liveness) -> SupervisorError {
    let status = match liveness {
        Liveness::Exited(status) => status,
        Liveness::Running => None,
    };
    SupervisorError::ExitedDuringStartup { status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::output::OutputBuffer;
    use crate::process::ProcessRunner;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast_config() -> ReadinessConfig {
        ReadinessConfig {
            interval_ms: 50,
            max_attempts: 10,
            probe_timeout_ms: 200,
        }
    }

    fn runner() -> ProcessRunner {
        let config = ProcessConfig::new("true", "true", "true", "http://127.0.0.1:1");
        ProcessRunner::new(&config, OutputBuffer::new(1024), false).unwrap()
    }

    /// Answer every connection with the given status line
    async fn serve(listener: TcpListener, status_line: &'static str) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }

    /// A port that nothing listens on
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn target(port: u16) -> Uri {
        format!("http://127.0.0.1:{}/", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_probe_accepts_any_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, "HTTP/1.1 500 Internal Server Error"));

        let poller = ReadinessPoller::new(target(port), &fast_config());
        assert!(poller.probe().await);
    }

    #[tokio::test]
    async fn test_probe_fails_on_refused_connection() {
        let port = free_port().await;
        let poller = ReadinessPoller::new(target(port), &fast_config());
        assert!(!poller.probe().await);
    }

    #[tokio::test]
    async fn test_wait_succeeds_once_reachable() {
        let port = free_port().await;
        let poller = ReadinessPoller::new(target(port), &fast_config());
        let process = runner().spawn("sleep 30").unwrap();

        // Start listening a few intervals in
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            serve(listener, "HTTP/1.1 404 Not Found").await;
        });

        let result = poller.wait_until_up(&process).await;
        assert!(result.is_ok(), "{:?}", result);
        process.kill().await;
    }

    #[tokio::test]
    async fn test_wait_times_out_within_bound() {
        let port = free_port().await;
        let poller = ReadinessPoller::new(target(port), &fast_config());
        let process = runner().spawn("sleep 30").unwrap();

        let start = Instant::now();
        let result = poller.wait_until_up(&process).await;
        let elapsed = start.elapsed();

        match result {
            Err(SupervisorError::ReadinessTimeout { attempts, interval }) => {
                assert_eq!(attempts, 10);
                assert_eq!(interval, Duration::from_millis(50));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(5));
        process.kill().await;
    }

    #[test]
    fn test_default_deadline_is_bounded_by_interval() {
        let poller = ReadinessPoller::new(target(1), &ReadinessConfig::default());
        assert_eq!(poller.deadline(), Duration::from_millis(20 * 200 + 200));
    }

    #[tokio::test]
    async fn test_silent_listener_does_not_stretch_the_wait() {
        // Accepts connections and never answers, so every probe would run
        // to its full timeout
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = ReadinessConfig {
            interval_ms: 50,
            max_attempts: 10,
            probe_timeout_ms: 1000,
        };
        let poller = ReadinessPoller::new(target(port), &config);
        let process = runner().spawn("sleep 30").unwrap();

        let start = Instant::now();
        let result = poller.wait_until_up(&process).await;
        let elapsed = start.elapsed();

        assert!(
            matches!(result, Err(SupervisorError::ReadinessTimeout { attempts: 10, .. })),
            "{:?}",
            result
        );
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
        process.kill().await;
    }

    #[tokio::test]
    async fn test_wait_fails_fast_when_process_exits() {
        let port = free_port().await;
        let mut config = fast_config();
        config.max_attempts = 100;
        let poller = ReadinessPoller::new(target(port), &config);
        let process = runner().spawn("sleep 0.1; exit 5").unwrap();

        let start = Instant::now();
        let result = poller.wait_until_up(&process).await;

        assert!(matches!(result, Err(SupervisorError::ExitedDuringStartup { .. })));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_wait_fails_immediately_when_not_running() {
        let port = free_port().await;
        let poller = ReadinessPoller::new(target(port), &fast_config());
        let process = runner().spawn("exit 0").unwrap();
        process.exited().await;

        let start = Instant::now();
        let result = poller.wait_until_up(&process).await;

        assert!(matches!(result, Err(SupervisorError::NotRunning)));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
