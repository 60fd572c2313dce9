//! Upstream proxy entries and the HTTP CONNECT handshake used to chain
//! through them.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::UpstreamError;

/// Largest CONNECT response header block accepted from an upstream.
const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// One configured upstream proxy and the local port that fronts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamProxyEntry {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    pub host: String,
    pub port: u16,
    pub local_port: u16,
    pub running: bool,
}

/// `host:port`, bracketing IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl UpstreamProxyEntry {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// `host:port` of the upstream itself.
    pub fn authority(&self) -> String {
        host_port(&self.host, self.port)
    }

    /// `http://[user[:pass]@]host:port`
    pub fn url(&self) -> String {
        let mut url = String::from("http://");
        if !self.username.is_empty() {
            url.push_str(&self.username);
            if !self.password.is_empty() {
                url.push(':');
                url.push_str(&self.password);
            }
            url.push('@');
        }
        url.push_str(&self.authority());
        url
    }

    /// Value for a `Proxy-Authorization` header, if credentials are set.
    pub fn proxy_authorization(&self) -> Option<String> {
        if !self.has_credentials() {
            return None;
        }
        let credentials = format!("{}:{}", self.username, self.password);
        Some(format!("Basic {}", STANDARD.encode(credentials.as_bytes())))
    }
}

/// Parse the user supplied proxy list.
///
/// One entry per line, `#` comments and blank lines ignored. Lines are
/// `user:pass:host:port` (four or more fields, extra fields ignored) or
/// `host:port`; anything else is dropped. Local ports are handed out from
/// `start_port` by line position.
pub fn parse_proxy_list(text: &str, start_port: u16) -> Vec<UpstreamProxyEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .filter_map(|(index, line)| {
            let parts: Vec<&str> = line.split(':').collect();
            let (username, password, host, port) = match parts.as_slice() {
                [user, pass, host, port, ..] => (*user, *pass, *host, *port),
                [host, port] => ("", "", *host, *port),
                _ => return None,
            };

            let host = host.trim();
            let port: u16 = port.trim().parse().ok()?;
            let local_port = u16::try_from(start_port as usize + index).ok()?;
            if host.is_empty() {
                return None;
            }

            Some(UpstreamProxyEntry {
                id: format!("proxy-{}", index),
                username: username.to_string(),
                password: password.to_string(),
                host: host.to_string(),
                port,
                local_port,
                running: false,
            })
        })
        .collect()
}

/// Ask an upstream proxy to open a tunnel to `target_host:target_port`.
///
/// Returns any bytes the upstream sent after its response header block;
/// they belong to the tunnel and must be forwarded to the client.
pub async fn open_tunnel<S>(
    stream: &mut S,
    upstream: &str,
    target_host: &str,
    target_port: u16,
    proxy_authorization: Option<&str>,
) -> Result<Vec<u8>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io_err = |source: std::io::Error| UpstreamError::Io {
        upstream: upstream.to_string(),
        source,
    };

    let target = host_port(target_host, target_port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = proxy_authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)?;

    let mut response = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&response) {
            break pos;
        }
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(UpstreamError::HeaderTooLarge {
                upstream: upstream.to_string(),
            });
        }
        let n = stream.read(&mut chunk).await.map_err(io_err)?;
        if n == 0 {
            return Err(UpstreamError::HandshakeClosed {
                upstream: upstream.to_string(),
            });
        }
        response.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&response[..header_end]);
    let status_line = head.lines().next().unwrap_or_default().trim().to_string();
    if status_code(&status_line) != Some(200) {
        return Err(UpstreamError::HandshakeRejected {
            upstream: upstream.to_string(),
            status_line,
        });
    }

    debug!(upstream, dest_host = target_host, dest_port = target_port, "Upstream tunnel established");
    Ok(response.split_off(header_end + 4))
}

/// Connect to an upstream and complete the CONNECT handshake.
pub async fn connect_via(
    entry: &UpstreamProxyEntry,
    target_host: &str,
    target_port: u16,
) -> Result<(TcpStream, Vec<u8>), UpstreamError> {
    let upstream = entry.authority();
    let mut stream = TcpStream::connect((entry.host.as_str(), entry.port))
        .await
        .map_err(|e| UpstreamError::ConnectionFailed {
            upstream: upstream.clone(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);

    let auth = entry.proxy_authorization();
    let leftover = open_tunnel(
        &mut stream,
        &upstream,
        target_host,
        target_port,
        auth.as_deref(),
    )
    .await?;
    Ok((stream, leftover))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
