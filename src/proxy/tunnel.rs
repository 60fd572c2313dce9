use std::io;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::traffic::{ByteCounter, TrafficRecorder};
use super::{ProxyBody, ProxyContext, RequestInfo, empty, text_response};
use crate::error::UpstreamError;
use crate::events::{TrafficEvent, TrafficPhase, now_ms};
use crate::rules::Action;
use crate::sni::{SniffEnd, sniff_client_hello};
use crate::upstream;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Split a CONNECT authority into host and port (default 443).
pub fn parse_connect_target(req: &Request<Incoming>) -> Option<(String, u16)> {
    let authority = req.uri().authority()?;
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return None;
    }
    Some((host, authority.port_u16().unwrap_or(443)))
}

/// Accept a CONNECT request and run the tunnel once the connection upgrades.
pub fn handle_connect(req: Request<Incoming>, ctx: Arc<ProxyContext>) -> Response<ProxyBody> {
    let Some((host, port)) = parse_connect_target(&req) else {
        debug!(uri = %req.uri(), "Rejecting CONNECT without authority");
        return text_response(StatusCode::BAD_REQUEST, "Bad Request");
    };

    let task_ctx = Arc::clone(&ctx);
    ctx.spawn_tracked(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => run_tunnel(TokioIo::new(upgraded), host, port, task_ctx).await,
            Err(e) => debug!(host = %host, error = %e, "CONNECT upgrade failed"),
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Sniff, route, dial and relay one tunnel.
///
/// The traffic record is published as `Open` once routed and as `Closed`
/// when this future completes or is dropped.
pub async fn run_tunnel<C>(mut client: C, host: String, port: u16, ctx: Arc<ProxyContext>)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let sniffed = sniff_client_hello(&mut client, &ctx.sniff).await;
    let sni_hostname = sniffed.sni.hostname.clone();

    let info = RequestInfo {
        hostname: host.clone(),
        port,
        sni_hostname: sni_hostname.clone(),
        method: "CONNECT".to_string(),
        is_https: true,
    };
    let decision = ctx.decider.decide(&info);
    debug!(
        host = %host,
        sni = sni_hostname.as_deref().unwrap_or("-"),
        tls = sniffed.sni.tls_version.as_deref().unwrap_or("-"),
        sniff_end = ?sniffed.end,
        action = %decision.action,
        rule = decision.matched_rule.as_deref().unwrap_or("-"),
        "Tunnel routed"
    );

    let recorder = TrafficRecorder::new(
        ctx.sink.clone(),
        TrafficEvent {
            id: 0,
            timestamp_ms: now_ms(),
            hostname: host.clone(),
            sni_hostname,
            method: "CONNECT".to_string(),
            url: upstream::host_port(&host, port),
            action: decision.action,
            matched_rule: decision.matched_rule.clone(),
            local_port: ctx.local_port,
            bytes_in: 0,
            bytes_out: 0,
            phase: TrafficPhase::Open,
        },
    );
    recorder.publish_open();

    if sniffed.end == SniffEnd::ClientClosed {
        debug!(host = %host, "Client closed before tunnel was established");
        return;
    }

    let dialed = match decision.action {
        Action::Direct => {
            let effective = info.effective_hostname().to_string();
            connect_direct(&effective, port).await.map(|s| (s, Vec::new()))
        }
        Action::Proxy => upstream::connect_via(&ctx.upstream, &host, port).await,
    };
    let (mut peer, leftover) = match dialed {
        Ok(dialed) => dialed,
        Err(e) => {
            warn!(host = %host, action = %decision.action, error = %e, "Tunnel dial failed");
            ctx.sink.upstream_error(ctx.local_port, e.to_string());
            return;
        }
    };

    let bytes_in = recorder.bytes_in();
    let bytes_out = recorder.bytes_out();

    if !sniffed.buffered.is_empty() {
        if let Err(e) = peer.write_all(&sniffed.buffered).await {
            debug!(host = %host, error = %e, "Failed to replay sniffed bytes");
            return;
        }
        bytes_out.add(sniffed.buffered.len());
    }
    if !leftover.is_empty() {
        if let Err(e) = client.write_all(&leftover).await {
            debug!(host = %host, error = %e, "Failed to forward upstream preamble");
            return;
        }
        bytes_in.add(leftover.len());
    }

    if let Err(e) = relay(&mut client, &mut peer, &bytes_out, &bytes_in).await {
        debug!(host = %host, error = %e, "Tunnel closed with error");
    }
    debug!(
        id = recorder.id(),
        host = %host,
        bytes_in = bytes_in.get(),
        bytes_out = bytes_out.get(),
        "Tunnel finished"
    );
}

async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, UpstreamError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| UpstreamError::ConnectionFailed {
            upstream: upstream::host_port(host, port),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Copy both directions until either side closes.
///
/// The first direction to reach EOF or fail ends the relay; the caller then
/// drops both streams, closing the peer that is still open.
pub async fn relay<A, B>(
    a: &mut A,
    b: &mut B,
    a_to_b: &ByteCounter,
    b_to_a: &ByteCounter,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        result = pipe(&mut a_read, &mut b_write, a_to_b) => result,
        result = pipe(&mut b_read, &mut a_write, b_to_a) => result,
    }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, counter: &ByteCounter) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.add(n);
    }
    writer.shutdown().await
}
