use sni_router::error::UpstreamError;
use sni_router::upstream::*;

#[test]
fn test_parse_proxy_list_formats() {
    let list = "
# office proxies
user:secret:proxy1.test:3128

proxy2.test:8080
bad-line
proxy3.test:notaport
a:b:proxy4.test:1080:extra
";
    let entries = parse_proxy_list(list, 9000);
    assert_eq!(entries.len(), 3);

    assert_eq!(entries[0].id, "proxy-0");
    assert_eq!(entries[0].username, "user");
    assert_eq!(entries[0].password, "secret");
    assert_eq!(entries[0].host, "proxy1.test");
    assert_eq!(entries[0].port, 3128);
    assert_eq!(entries[0].local_port, 9000);
    assert!(!entries[0].running);

    assert_eq!(entries[1].host, "proxy2.test");
    assert_eq!(entries[1].username, "");
    assert_eq!(entries[1].local_port, 9001);

    // Local ports follow line position, dropped lines included
    assert_eq!(entries[2].host, "proxy4.test");
    assert_eq!(entries[2].port, 1080);
    assert_eq!(entries[2].id, "proxy-4");
    assert_eq!(entries[2].local_port, 9004);
}

#[test]
fn test_parse_proxy_list_empty() {
    assert!(parse_proxy_list("", 8080).is_empty());
    assert!(parse_proxy_list("# only comments\n\n", 8080).is_empty());
}

#[test]
fn test_parse_proxy_list_local_port_overflow() {
    let entries = parse_proxy_list("a.test:1\nb.test:2", u16::MAX);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].local_port, u16::MAX);
}

#[test]
fn test_proxy_authorization() {
    let entries = parse_proxy_list("u:p:upstream.test:3128\nopen.test:3128", 9000);
    assert_eq!(
        entries[0].proxy_authorization().as_deref(),
        Some("Basic dTpw")
    );
    assert_eq!(entries[1].proxy_authorization(), None);
    assert_eq!(entries[0].url(), "http://u:p@upstream.test:3128");
    assert_eq!(entries[1].url(), "http://open.test:3128");
    assert_eq!(entries[0].authority(), "upstream.test:3128");
}

#[test]
fn test_password_not_serialized() {
    let entries = parse_proxy_list("u:hunter2:upstream.test:3128", 9000);
    let json = serde_json::to_string(&entries[0]).unwrap();
    assert!(!json.contains("hunter2"));
    assert!(json.contains("\"username\":\"u\""));
}

#[tokio::test]
async fn test_open_tunnel_sends_connect_with_auth() {
    let mut stream = tokio_test::io::Builder::new()
        .write(
            b"CONNECT api.external.com:443 HTTP/1.1\r\n\
              Host: api.external.com:443\r\n\
              Proxy-Authorization: Basic dTpw\r\n\r\n",
        )
        .read(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .build();

    let leftover = open_tunnel(
        &mut stream,
        "upstream.test:3128",
        "api.external.com",
        443,
        Some("Basic dTpw"),
    )
    .await
    .unwrap();
    assert!(leftover.is_empty());
}

#[test]
fn test_host_port_brackets_ipv6() {
    assert_eq!(host_port("example.com", 443), "example.com:443");
    assert_eq!(host_port("10.0.0.1", 80), "10.0.0.1:80");
    assert_eq!(host_port("::1", 443), "[::1]:443");
}

#[tokio::test]
async fn test_open_tunnel_brackets_ipv6_target() {
    let mut stream = tokio_test::io::Builder::new()
        .write(b"CONNECT [2001:db8::1]:443 HTTP/1.1\r\nHost: [2001:db8::1]:443\r\n\r\n")
        .read(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .build();

    let leftover = open_tunnel(&mut stream, "up:1", "2001:db8::1", 443, None)
        .await
        .unwrap();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn test_open_tunnel_returns_leftover_bytes() {
    let mut stream = tokio_test::io::Builder::new()
        .write(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test:443\r\n\r\n")
        .read(b"HTTP/1.0 200 OK\r\nX-Via: up\r\n\r\nearly")
        .build();

    let leftover = open_tunnel(&mut stream, "up:1", "a.test", 443, None)
        .await
        .unwrap();
    assert_eq!(leftover, b"early");
}

#[tokio::test]
async fn test_open_tunnel_rejected() {
    let mut stream = tokio_test::io::Builder::new()
        .write(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test:443\r\n\r\n")
        .read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
        .build();

    let err = open_tunnel(&mut stream, "up:1", "a.test", 443, None)
        .await
        .unwrap_err();
    match err {
        UpstreamError::HandshakeRejected { status_line, .. } => {
            assert_eq!(status_line, "HTTP/1.1 407 Proxy Authentication Required");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_open_tunnel_closed_early() {
    let mut stream = tokio_test::io::Builder::new()
        .write(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test:443\r\n\r\n")
        .read(b"HTTP/1.1 200")
        .build();

    let err = open_tunnel(&mut stream, "up:1", "a.test", 443, None)
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::HandshakeClosed { .. }));
}

#[tokio::test]
async fn test_connect_via_unreachable_upstream() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let entries = parse_proxy_list(&format!("127.0.0.1:{}", port), 9000);
    let err = connect_via(&entries[0], "a.test", 443).await.unwrap_err();
    assert!(matches!(err, UpstreamError::ConnectionFailed { .. }));
}
