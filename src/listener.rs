//! One local proxy listener fronting one upstream proxy.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::ListenerError;
use crate::events::TrafficSink;
use crate::proxy::{self, ProxyContext, RouteDecider};
use crate::sni::SniffConfig;
use crate::upstream::UpstreamProxyEntry;

/// What a listener binds and who it forwards for.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub bind_address: IpAddr,
    /// Port to bind; `0` asks the OS for one.
    pub port: u16,
    pub upstream: UpstreamProxyEntry,
    pub sniff: SniffConfig,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Local HTTP proxy endpoint.
///
/// Every socket it accepts or opens is owned by a task in its tracker, so
/// [`ProxyListener::stop`] returns only after all of them are closed.
pub struct ProxyListener {
    options: ListenerOptions,
    decider: Arc<dyn RouteDecider>,
    sink: Arc<dyn TrafficSink>,
    running: Option<Running>,
}

impl ProxyListener {
    pub fn new(
        options: ListenerOptions,
        decider: Arc<dyn RouteDecider>,
        sink: Arc<dyn TrafficSink>,
    ) -> Self {
        Self {
            options,
            decider,
            sink,
            running: None,
        }
    }

    /// Bind and begin accepting. Calling it on a running listener returns
    /// the existing address.
    pub async fn start(&mut self) -> Result<SocketAddr, ListenerError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let addr = SocketAddr::new(self.options.bind_address, self.options.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ListenerError::from_bind(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ListenerError::from_bind(addr, e))?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ctx = Arc::new(ProxyContext {
            local_port: local_addr.port(),
            upstream: self.options.upstream.clone(),
            decider: Arc::clone(&self.decider),
            sink: Arc::clone(&self.sink),
            sniff: self.options.sniff.clone(),
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
        });

        tracker.spawn(accept_loop(listener, ctx));

        info!(
            local = %local_addr,
            upstream = %self.options.upstream.authority(),
            "Proxy listener started"
        );
        self.running = Some(Running {
            local_addr,
            shutdown,
            tracker,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close every connection and wait until they are gone.
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.cancel();
        running.tracker.close();
        running.tracker.wait().await;
        info!(local = %running.local_addr, "Proxy listener stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Tasks still holding sockets, the accept loop included.
    pub fn active_connections(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.tracker.len())
    }

    pub fn upstream(&self) -> &UpstreamProxyEntry {
        &self.options.upstream
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ProxyContext>) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, local_port = ctx.local_port, "Accepted proxy client");
                let _ = stream.set_nodelay(true);
                let conn_ctx = Arc::clone(&ctx);
                ctx.spawn_tracked(async move {
                    let service = service_fn(move |req| proxy::handle(req, Arc::clone(&conn_ctx)));
                    if let Err(e) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        debug!(peer = %peer, error = %e, "Client connection ended with error");
                    }
                });
            }
            Err(e) => {
                error!(local_port = ctx.local_port, error = %e, "Accept failed");
                ctx.sink.listener_error(ctx.local_port, e.to_string());
                // Avoid a tight loop on persistent accept errors
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
