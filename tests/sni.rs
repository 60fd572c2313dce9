mod common;

use common::client_hello;
use sni_router::sni::*;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[test]
fn test_parse_sni_hostname() {
    let hello = client_hello("example.com");
    let info = parse_sni(&hello);
    assert_eq!(info.hostname.as_deref(), Some("example.com"));
    assert_eq!(info.tls_version.as_deref(), Some("TLS 1.0"));
}

#[test]
fn test_parse_sni_wrong_record_type() {
    let mut hello = client_hello("example.com");
    hello[0] = 0x17;
    assert_eq!(parse_sni(&hello).hostname, None);
    assert!(!is_tls_client_hello(&hello));
}

#[test]
fn test_parse_sni_truncated_record() {
    let hello = client_hello("example.com");
    let truncated = &hello[..hello.len() / 2];
    let info = parse_sni(truncated);
    assert_eq!(info.hostname, None);

    // Every prefix must be handled without panicking
    for len in 0..hello.len() {
        let _ = parse_sni(&hello[..len]);
    }
}

#[test]
fn test_parse_sni_garbage_lengths() {
    let mut hello = client_hello("example.com");
    // Corrupt the extensions length to point past the record
    let ext_len_offset = 5 + 4 + 2 + 32 + 1 + 4 + 2;
    hello[ext_len_offset] = 0xff;
    hello[ext_len_offset + 1] = 0xff;
    assert_eq!(parse_sni(&hello).hostname, None);
}

#[test]
fn test_tls_version_names() {
    assert_eq!(tls_version_name(0x0300), "SSL 3.0");
    assert_eq!(tls_version_name(0x0303), "TLS 1.2");
    assert_eq!(tls_version_name(0x0304), "TLS 1.3");
    assert_eq!(tls_version_name(0x7f1c), "Unknown (0x7f1c)");
}

#[test]
fn test_is_tls_client_hello() {
    let hello = client_hello("a.test");
    assert!(is_tls_client_hello(&hello));
    assert!(!is_tls_client_hello(&hello[..5]));
    assert!(!is_tls_client_hello(b"GET / HTTP/1.1\r\n"));
}

#[test]
fn test_hello_progress() {
    let hello = client_hello("a.test");
    assert_eq!(hello_progress(&[]), HelloProgress::NeedMore);
    assert_eq!(hello_progress(&hello[..10]), HelloProgress::NeedMore);
    assert_eq!(hello_progress(&hello), HelloProgress::Complete);
    assert_eq!(hello_progress(b"SSH-2.0"), HelloProgress::NotTls);
}

#[tokio::test]
async fn test_sniff_complete_hello() {
    let hello = client_hello("secure.example");
    let mut stream = tokio_test::io::Builder::new().read(&hello).build();
    let sniffed = sniff_client_hello(&mut stream, &SniffConfig::default()).await;
    assert_eq!(sniffed.end, SniffEnd::Complete);
    assert_eq!(sniffed.sni.hostname.as_deref(), Some("secure.example"));
    assert_eq!(sniffed.buffered, hello);
}

#[tokio::test]
async fn test_sniff_hello_split_across_reads() {
    let hello = client_hello("split.example");
    let (first, second) = hello.split_at(7);
    let mut stream = tokio_test::io::Builder::new()
        .read(first)
        .read(second)
        .build();
    let sniffed = sniff_client_hello(&mut stream, &SniffConfig::default()).await;
    assert_eq!(sniffed.end, SniffEnd::Complete);
    assert_eq!(sniffed.sni.hostname.as_deref(), Some("split.example"));
}

#[tokio::test]
async fn test_sniff_plain_bytes_stop_immediately() {
    let mut stream = tokio_test::io::Builder::new().read(b"hello").build();
    let sniffed = sniff_client_hello(&mut stream, &SniffConfig::default()).await;
    assert_eq!(sniffed.end, SniffEnd::NotTls);
    assert_eq!(sniffed.buffered, b"hello");
    assert_eq!(sniffed.sni.hostname, None);
}

#[tokio::test]
async fn test_sniff_times_out_without_data() {
    let (mut client, mut server) = tokio::io::duplex(64);
    let config = SniffConfig {
        timeout: Duration::from_millis(50),
        max_bytes: DEFAULT_MAX_SNIFF_BYTES,
    };
    let sniffed = sniff_client_hello(&mut server, &config).await;
    assert_eq!(sniffed.end, SniffEnd::Timeout);
    assert!(sniffed.buffered.is_empty());
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sniff_respects_byte_cap() {
    let hello = client_hello("capped.example");
    let mut stream = tokio_test::io::Builder::new().read(&hello[..16]).build();
    let config = SniffConfig {
        timeout: Duration::from_secs(1),
        max_bytes: 16,
    };
    let sniffed = sniff_client_hello(&mut stream, &config).await;
    assert_eq!(sniffed.end, SniffEnd::LimitReached);
    assert_eq!(sniffed.buffered.len(), 16);
}

#[tokio::test]
async fn test_sniff_client_closed() {
    let mut stream = tokio_test::io::Builder::new().build();
    let sniffed = sniff_client_hello(&mut stream, &SniffConfig::default()).await;
    assert_eq!(sniffed.end, SniffEnd::ClientClosed);
}
