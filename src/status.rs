//! Read-only HTTP status endpoint.

use crate::config::StatusConfig;
use crate::fleet::ProxyFleet;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const DEFAULT_TRAFFIC_LIMIT: usize = 100;

pub struct StatusServer {
    listener: TcpListener,
    fleet: Arc<ProxyFleet>,
}

impl StatusServer {
    pub async fn bind(config: &StatusConfig, fleet: Arc<ProxyFleet>) -> Result<Self> {
        let bind_addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind status server to {}", bind_addr))?;
        Ok(Self { listener, fleet })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read status server address")
    }

    /// Serve until the task is aborted.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Status server listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let fleet = Arc::clone(&self.fleet);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let fleet = Arc::clone(&fleet);
                            async move { Ok::<_, Infallible>(handle_status(req, &fleet).await) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("Status connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Status server accept error: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_status<B>(req: Request<B>, fleet: &ProxyFleet) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    match req.uri().path() {
        "/health" => json(
            serde_json::json!({
                "status": "healthy",
                "service": "sni-router"
            })
            .to_string(),
        ),
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(fleet.metrics().render())))
            .unwrap_or_else(|_| text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")),
        "/status" => {
            let status = fleet.get_status().await;
            json(
                serde_json::json!({
                    "running": status.running,
                    "running_count": status.running_count(),
                    "total_count": status.total_count(),
                    "proxies": status.proxies,
                    "local_ips": status.local_ips,
                })
                .to_string(),
            )
        }
        "/traffic" => {
            let limit = traffic_limit(req.uri().query());
            let events = fleet.traffic_logs(limit);
            match serde_json::to_string(&events) {
                Ok(body) => json(body),
                Err(e) => {
                    error!("Failed to serialize traffic log: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
                }
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not found"),
    }
}

/// `limit=N` from the query string, falling back to the default.
fn traffic_limit(query: Option<&str>) -> usize {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "limit")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(DEFAULT_TRAFFIC_LIMIT)
}

fn json(body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_limit_parsing() {
        assert_eq!(traffic_limit(None), 100);
        assert_eq!(traffic_limit(Some("limit=5")), 5);
        assert_eq!(traffic_limit(Some("x=1&limit=7")), 7);
        assert_eq!(traffic_limit(Some("limit=abc")), 100);
    }
}
