//! Per-connection proxy handling.
//!
//! Each accepted connection speaks HTTP/1.1 proxy semantics: absolute-form
//! requests are forwarded ([`http`]), `CONNECT` opens a byte tunnel after an
//! SNI sniff ([`tunnel`]). Both ask a [`RouteDecider`] whether to go direct
//! or through the listener's upstream proxy.

pub mod body;
pub mod http;
pub mod traffic;
pub mod tunnel;

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::events::TrafficSink;
use crate::rules::{Action, RuleRouter};
use crate::sni::SniffConfig;
use crate::upstream::UpstreamProxyEntry;

/// Response body type produced by the proxy service.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// What is known about a connection when it is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub hostname: String,
    pub port: u16,
    pub sni_hostname: Option<String>,
    pub method: String,
    pub is_https: bool,
}

impl RequestInfo {
    /// SNI hostname when present, otherwise the declared hostname.
    pub fn effective_hostname(&self) -> &str {
        self.sni_hostname.as_deref().unwrap_or(&self.hostname)
    }
}

/// Routing outcome handed back to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDecision {
    pub action: Action,
    /// Name of the rule that matched, if any.
    pub matched_rule: Option<String>,
}

/// Routing policy injected into listeners.
pub trait RouteDecider: Send + Sync {
    fn decide(&self, info: &RequestInfo) -> RequestDecision;
}

impl RouteDecider for RuleRouter {
    fn decide(&self, info: &RequestInfo) -> RequestDecision {
        let matched = self.match_host(info.effective_hostname());
        RequestDecision {
            action: matched.action,
            matched_rule: matched.matched_rule.map(|rule| rule.name),
        }
    }
}

impl<F> RouteDecider for F
where
    F: Fn(&RequestInfo) -> RequestDecision + Send + Sync,
{
    fn decide(&self, info: &RequestInfo) -> RequestDecision {
        self(info)
    }
}

/// Everything a connection on one listener needs.
pub struct ProxyContext {
    pub local_port: u16,
    pub upstream: UpstreamProxyEntry,
    pub decider: Arc<dyn RouteDecider>,
    pub sink: Arc<dyn TrafficSink>,
    pub sniff: SniffConfig,
    /// Tracks every task that owns a socket for this listener.
    pub tracker: TaskTracker,
    /// Cancelled when the listener stops; tasks drop their sockets.
    pub shutdown: CancellationToken,
}

impl ProxyContext {
    /// Spawn a socket-owning task that ends when the listener stops.
    pub fn spawn_tracked<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = fut => {}
            }
        });
    }
}

/// Service entry point for one request on a client connection.
pub async fn handle(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        Ok(tunnel::handle_connect(req, ctx))
    } else {
        Ok(http::forward(req, ctx).await)
    }
}

/// Small fixed response with a text body.
pub fn text_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(text));
    *response.status_mut() = status;
    response
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
