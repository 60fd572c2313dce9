//! TLS ClientHello inspection.
//!
//! Reads the cleartext ClientHello that precedes a TLS handshake and pulls
//! out the `server_name` extension (RFC 5246 record framing, RFC 6066 SNI).
//! Nothing here ever decrypts traffic; malformed input simply yields no
//! hostname.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;

/// Default time to wait for a ClientHello after the tunnel is accepted.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(300);

/// Default cap on bytes buffered while sniffing.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

/// Outcome of parsing a ClientHello buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniInfo {
    pub hostname: Option<String>,
    pub tls_version: Option<String>,
}

/// Human readable name of a TLS record version.
pub fn tls_version_name(version: u16) -> String {
    match version {
        0x0300 => "SSL 3.0".to_string(),
        0x0301 => "TLS 1.0".to_string(),
        0x0302 => "TLS 1.1".to_string(),
        0x0303 => "TLS 1.2".to_string(),
        0x0304 => "TLS 1.3".to_string(),
        other => format!("Unknown (0x{:04x})", other),
    }
}

/// Cheap check that a buffer starts like a TLS ClientHello record.
///
/// Looks at the record type, the record version and the handshake type only,
/// so it needs just 6 bytes.
pub fn is_tls_client_hello(buf: &[u8]) -> bool {
    if buf.len() < 6 || buf[0] != RECORD_TYPE_HANDSHAKE {
        return false;
    }
    let version = u16::from_be_bytes([buf[1], buf[2]]);
    (0x0301..=0x0304).contains(&version) && buf[5] == HANDSHAKE_TYPE_CLIENT_HELLO
}

/// Parse the SNI hostname out of a ClientHello record.
///
/// Never panics. A buffer that is too short for the record length it
/// declares returns an empty hostname so the caller can wait for more bytes.
pub fn parse_sni(buf: &[u8]) -> SniInfo {
    let mut info = SniInfo::default();

    if buf.len() < RECORD_HEADER_LEN || buf[0] != RECORD_TYPE_HANDSHAKE {
        return info;
    }

    info.tls_version = Some(tls_version_name(u16::from_be_bytes([buf[1], buf[2]])));

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < RECORD_HEADER_LEN + record_len {
        return info;
    }

    info.hostname = server_name(buf);
    info
}

fn server_name(buf: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(buf, RECORD_HEADER_LEN);

    if cur.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    let handshake_len = cur.u24()?;
    if cur.remaining() < handshake_len {
        return None;
    }

    // client version + random
    cur.skip(2 + 32)?;
    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;
    let cipher_suites_len = cur.u16()? as usize;
    cur.skip(cipher_suites_len)?;
    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    let extensions_len = cur.u16()? as usize;
    let mut extensions = cur.take(extensions_len)?;

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let mut payload = extensions.take(ext_len)?;

        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let list_len = payload.u16()? as usize;
        let mut list = payload.take(list_len)?;
        while list.remaining() >= 3 {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.bytes(name_len)?;
            if name_type == NAME_TYPE_HOST_NAME {
                return ascii_hostname(name);
            }
        }
        return None;
    }

    None
}

fn ascii_hostname(name: &[u8]) -> Option<String> {
    if name.is_empty() || !name.is_ascii() {
        return None;
    }
    std::str::from_utf8(name).ok().map(str::to_string)
}

/// Bounds-checked reader over a byte slice; every overrun yields `None`.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn take(&mut self, n: usize) -> Option<Cursor<'a>> {
        self.bytes(n).map(|b| Cursor::new(b, 0))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.bytes(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

/// How far along a partially received ClientHello is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloProgress {
    /// Not enough bytes yet to decide anything.
    NeedMore,
    /// The bytes are not a TLS ClientHello record.
    NotTls,
    /// The whole record announced by the header has arrived.
    Complete,
}

/// Classify a sniff buffer without parsing the full ClientHello.
pub fn hello_progress(buf: &[u8]) -> HelloProgress {
    if buf.is_empty() {
        return HelloProgress::NeedMore;
    }
    if buf[0] != RECORD_TYPE_HANDSHAKE {
        return HelloProgress::NotTls;
    }
    if buf.len() < 6 {
        return HelloProgress::NeedMore;
    }
    if !is_tls_client_hello(buf) {
        return HelloProgress::NotTls;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() >= RECORD_HEADER_LEN + record_len {
        HelloProgress::Complete
    } else {
        HelloProgress::NeedMore
    }
}

/// Bounds for SNI sniffing on a freshly opened tunnel.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Maximum time to wait for the ClientHello.
    pub timeout: Duration,
    /// Maximum bytes to buffer.
    pub max_bytes: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Why sniffing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffEnd {
    /// A complete ClientHello record was buffered.
    Complete,
    /// The first bytes are not TLS.
    NotTls,
    /// Timeout elapsed before a decision could be made.
    Timeout,
    /// The buffer cap was reached.
    LimitReached,
    /// The client closed (or errored) while sniffing.
    ClientClosed,
}

/// Result of sniffing the start of a tunnel.
#[derive(Debug)]
pub struct Sniffed {
    /// Every byte read from the client; must be forwarded to the peer.
    pub buffered: Vec<u8>,
    pub sni: SniInfo,
    pub end: SniffEnd,
}

/// Buffer the first bytes of a tunnel and try to extract the SNI hostname.
///
/// Stops as soon as the record is complete, the bytes turn out not to be
/// TLS, the cap is hit, or the deadline passes.
pub async fn sniff_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    config: &SniffConfig,
) -> Sniffed {
    let deadline = Instant::now() + config.timeout;
    let mut buffered = Vec::with_capacity(config.max_bytes.min(4096));
    let mut chunk = vec![0u8; config.max_bytes.min(4096)];

    let end = loop {
        match hello_progress(&buffered) {
            HelloProgress::Complete => break SniffEnd::Complete,
            HelloProgress::NotTls => break SniffEnd::NotTls,
            HelloProgress::NeedMore => {}
        }
        if buffered.len() >= config.max_bytes {
            break SniffEnd::LimitReached;
        }

        let want = (config.max_bytes - buffered.len()).min(chunk.len());
        match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Ok(Ok(0)) => break SniffEnd::ClientClosed,
            Ok(Ok(n)) => buffered.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                debug!(error = %e, "client read failed while sniffing");
                break SniffEnd::ClientClosed;
            }
            Err(_) => break SniffEnd::Timeout,
        }
    };

    let sni = match end {
        SniffEnd::Complete => parse_sni(&buffered),
        _ => SniInfo::default(),
    };

    Sniffed { buffered, sni, end }
}
