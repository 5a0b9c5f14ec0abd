//! Prometheus metrics server
//!
//! Serves the Prometheus exposition at `/metrics`, a liveness check at
//! `/health`, and the JSON cutover snapshot at `/status`.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Result, TandemError};

/// HTTP body type for responses
type Body = http_body_util::Full<bytes::Bytes>;

/// Renders the current cutover status as JSON for `/status`
pub type StatusProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Prometheus metrics server
pub struct MetricsServer {
    /// The Prometheus handle for rendering metrics
    handle: PrometheusHandle,

    /// Server address
    addr: SocketAddr,

    /// Source of the `/status` document
    status: Option<StatusProvider>,
}

impl MetricsServer {
    /// Create a new metrics server and install the global recorder
    pub fn new(addr: SocketAddr) -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| TandemError::Metrics(e.to_string()))?;

        Ok(Self {
            handle,
            addr,
            status: None,
        })
    }

    /// Attach a provider for the `/status` endpoint
    pub fn with_status(mut self, status: StatusProvider) -> Self {
        self.status = Some(status);
        self
    }

    /// Run the metrics server
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics server listening on {}", self.addr);

        let handle = Arc::new(self.handle);
        let status = self.status;

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let handle = handle.clone();
            let status = status.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handle = handle.clone();
                    let status = status.clone();
                    async move { handle_request(req, handle, status).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {}", e);
                }
            });
        }
    }

    /// Get the Prometheus handle for rendering in-process
    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Body> {
    let mut response = Response::new(Body::new(bytes::Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handle an incoming HTTP request
async fn handle_request(
    req: Request<Incoming>,
    handle: Arc<PrometheusHandle>,
    status: Option<StatusProvider>,
) -> std::result::Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; charset=utf-8",
            handle.render(),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "OK".to_string()),
        (&Method::GET, "/status") => match status {
            Some(provider) => respond(StatusCode::OK, "application/json", provider()),
            None => respond(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                "no cutover attached".to_string(),
            ),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}
