use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{HOST, HeaderValue, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::body::CountingBody;
use super::traffic::TrafficRecorder;
use super::{ProxyBody, ProxyContext, RequestInfo, text_response};
use crate::error::{ProxyError, ProxyResult, UpstreamError};
use crate::events::{TrafficEvent, TrafficPhase, now_ms};
use crate::rules::Action;
use crate::upstream;

/// Where a plain HTTP request is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub host: String,
    pub port: u16,
    /// Origin-form path and query, always starting with `/`.
    pub path: String,
}

impl HttpTarget {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        upstream::host_port(&self.host, self.port)
    }

    /// Absolute-form URI for sending through another proxy.
    pub fn absolute_uri(&self) -> String {
        format!("http://{}{}", self.authority(), self.path)
    }
}

/// Work out the destination of a proxied request.
///
/// Absolute-form targets (`http://host[:port]/path`) are used as given. For
/// origin-form targets the `Host` header supplies host and port. Port
/// defaults to 80.
pub fn resolve_target<B>(req: &Request<B>) -> ProxyResult<HttpTarget> {
    let uri = req.uri();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or("/")
        .to_string();

    let (host, port) = match uri.scheme_str() {
        Some("http") => {
            let host = uri
                .host()
                .ok_or_else(|| ProxyError::InvalidTarget(uri.to_string()))?;
            (host.to_string(), uri.port_u16().unwrap_or(80))
        }
        Some(other) => {
            return Err(ProxyError::InvalidTarget(format!(
                "unsupported scheme '{}' in {}",
                other, uri
            )));
        }
        None => {
            let header = req
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| ProxyError::InvalidTarget(format!("no Host header for {}", uri)))?;
            let authority: hyper::http::uri::Authority = header
                .parse()
                .map_err(|_| ProxyError::InvalidTarget(format!("bad Host header '{}'", header)))?;
            (authority.host().to_string(), authority.port_u16().unwrap_or(80))
        }
    };

    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    if host.is_empty() {
        return Err(ProxyError::InvalidTarget(uri.to_string()));
    }

    Ok(HttpTarget { host, port, path })
}

/// Forward one plain HTTP request, directly or through the upstream proxy.
///
/// Responds 400 when the destination cannot be determined and 502 when the
/// origin or upstream cannot be reached. The traffic record is published
/// when the response body finishes or is dropped.
pub async fn forward(req: Request<Incoming>, ctx: Arc<ProxyContext>) -> Response<ProxyBody> {
    let target = match resolve_target(&req) {
        Ok(target) => target,
        Err(e) => {
            debug!(error = %e, "Rejecting request");
            return text_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let method = req.method().to_string();
    let info = RequestInfo {
        hostname: target.host.clone(),
        port: target.port,
        sni_hostname: None,
        method: method.clone(),
        is_https: false,
    };
    let decision = ctx.decider.decide(&info);
    debug!(
        method = %method,
        host = %target.host,
        port = target.port,
        action = %decision.action,
        rule = decision.matched_rule.as_deref().unwrap_or("-"),
        "HTTP request routed"
    );

    let recorder = TrafficRecorder::new(
        ctx.sink.clone(),
        TrafficEvent {
            id: 0,
            timestamp_ms: now_ms(),
            hostname: target.host.clone(),
            sni_hostname: None,
            method,
            url: target.authority(),
            action: decision.action,
            matched_rule: decision.matched_rule.clone(),
            local_port: ctx.local_port,
            bytes_in: 0,
            bytes_out: 0,
            phase: TrafficPhase::Closed,
        },
    );

    let (mut parts, body) = req.into_parts();
    parts.headers.remove("proxy-connection");
    parts.headers.remove(PROXY_AUTHORIZATION);
    if !parts.headers.contains_key(HOST) {
        let host_value = match target.port {
            80 => target.host.clone(),
            _ => target.authority(),
        };
        if let Ok(value) = HeaderValue::from_str(&host_value) {
            parts.headers.insert(HOST, value);
        }
    }

    let (dial_host, dial_port, outbound_uri) = match decision.action {
        Action::Direct => (target.host.clone(), target.port, target.path.clone()),
        Action::Proxy => {
            if let Some(auth) = ctx.upstream.proxy_authorization()
                && let Ok(value) = HeaderValue::from_str(&auth)
            {
                parts.headers.insert(PROXY_AUTHORIZATION, value);
            }
            (
                ctx.upstream.host.clone(),
                ctx.upstream.port,
                target.absolute_uri(),
            )
        }
    };
    parts.uri = match outbound_uri.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            debug!(uri = %outbound_uri, error = %e, "Rejecting unparsable request target");
            return text_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let outbound = Request::from_parts(parts, CountingBody::new(body, recorder.bytes_out()));
    match send_request(&ctx, &dial_host, dial_port, outbound).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            let body = CountingBody::new(body, recorder.bytes_in())
                .with_recorder(recorder)
                .boxed_unsync();
            Response::from_parts(parts, body)
        }
        Err(e) => {
            warn!(
                host = %target.host,
                action = %decision.action,
                error = %e,
                "HTTP forward failed"
            );
            ctx.sink.upstream_error(ctx.local_port, e.to_string());
            text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

async fn send_request(
    ctx: &ProxyContext,
    host: &str,
    port: u16,
    req: Request<CountingBody<Incoming>>,
) -> Result<Response<Incoming>, UpstreamError> {
    let upstream = upstream::host_port(host, port);
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| UpstreamError::ConnectionFailed {
            upstream: upstream.clone(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = client_http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| UpstreamError::RequestFailed {
            upstream: upstream.clone(),
            reason: e.to_string(),
        })?;

    // The connection must keep running while the response body streams.
    ctx.spawn_tracked(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Outbound HTTP connection ended with error");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| UpstreamError::RequestFailed {
            upstream,
            reason: e.to_string(),
        })
}
