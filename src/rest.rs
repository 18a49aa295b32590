//! Minimal HTTP status endpoint.
//!
//! A lightweight HTTP server exposing liveness and metrics for load
//! balancers and monitoring systems. Disabled entirely when the builder
//! is given `http_port == 0`.
//!
//! # Endpoints
//!
//! - `GET /health` - liveness check, 200 while the runtime is open
//! - `GET /metrics` - Prometheus metrics in text format

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lifecycle::Managed;
use crate::metrics;
use crate::tasks::TaskRegistry;

/// HTTP status server bound at open time.
pub struct StatusServer {
    host: String,
    port: u16,
    runtime_open: Arc<AtomicBool>,
    bound_port: std::sync::Mutex<Option<u16>>,
    tasks: Mutex<TaskRegistry>,
    open: AtomicBool,
}

impl StatusServer {
    /// Create a status server for `host:port`. `runtime_open` drives the
    /// health verdict.
    pub fn new(host: impl Into<String>, port: u16, runtime_open: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            port,
            runtime_open,
            bound_port: std::sync::Mutex::new(None),
            tasks: Mutex::new(TaskRegistry::new()),
            open: AtomicBool::new(false),
        })
    }

    /// The port actually bound, once open. Useful with port 0 in tests.
    pub fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock().expect("port cell poisoned")
    }

    async fn handle_connection(stream: tokio::net::TcpStream, healthy: bool) {
        let mut stream = stream;
        let mut buffer = [0u8; 1024];
        let read = match stream.read(&mut buffer).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Status connection read failed");
                return;
            }
        };
        let request = String::from_utf8_lossy(&buffer[..read]);
        let path = request
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();

        let (status, body) = match path.as_str() {
            "/health" => {
                if healthy {
                    ("200 OK", "ok\n".to_string())
                } else {
                    ("503 Service Unavailable", "not open\n".to_string())
                }
            }
            "/metrics" => ("200 OK", metrics::gather_text()),
            _ => ("404 Not Found", "not found\n".to_string()),
        };

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        if let Err(e) = stream.write_all(response.as_bytes()).await {
            debug!(error = %e, "Status connection write failed");
        }
    }
}

#[async_trait]
impl Managed for StatusServer {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn open(&self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let local = listener.local_addr()?;
        *self.bound_port.lock().expect("port cell poisoned") = Some(local.port());
        info!(addr = %local, "Status server listening");

        let runtime_open = self.runtime_open.clone();
        self.tasks.lock().await.spawn("status-accept", async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let healthy = runtime_open.load(Ordering::SeqCst);
                        tokio::spawn(Self::handle_connection(stream, healthy));
                    }
                    Err(e) => {
                        warn!(error = %e, "Status accept failed");
                    }
                }
            }
        });

        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.tasks.lock().await.shutdown_all().await;
        *self.bound_port.lock().expect("port cell poisoned") = None;
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
