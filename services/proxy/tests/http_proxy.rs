
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{
    closed_port_v6, http_auth, read_head, wait_until, HttpOriginBackend, ProxyHandle,
    StallingBackend, TcpEchoBackend,
};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn loopback() -> IpAddr {
    "::1".parse().unwrap()
}

#[tokio::test]
async fn connect_tunnel_relays_bytes_from_pool_address() {
    let backend = TcpEchoBackend::spawn_v6().await.unwrap();
    let proxy = ProxyHandle::spawn_v6().await.unwrap();

    let result = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        client
            .write_all(
                format!(
                    "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Authorization: {1}\r\n\r\n",
                    backend.addr,
                    http_auth()
                )
                .as_bytes(),
            )
            .await?;

        let response = read_head(&mut client).await?;
        assert_eq!(response, "HTTP/1.0 200 OK\r\n\r\n");

        client.write_all(b"ping over tunnel").await?;
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await
    .expect("timeout")
    .unwrap();

    assert_eq!(&result, b"ping over tunnel");
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(backend.peer_ips(), vec![loopback()]);
    assert_eq!(proxy.http.stats().dial_succeeded.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn connect_forwards_bytes_sent_with_the_request() {
    let backend = TcpEchoBackend::spawn_v6().await.unwrap();
    let proxy = ProxyHandle::spawn_v6().await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        client
            .write_all(
                format!(
                    "CONNECT {} HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\nearly",
                    backend.addr,
                    http_auth()
                )
                .as_bytes(),
            )
            .await?;

        let response = read_head(&mut client).await?;
        assert!(response.starts_with("HTTP/1.0 200 "));
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await
    .expect("timeout")
    .unwrap();

    assert_eq!(&echoed, b"early");
}

#[tokio::test]
async fn connect_by_hostname_dials_its_ipv6_address() {
    let backend = TcpEchoBackend::spawn_v6().await.unwrap();
    let proxy = ProxyHandle::spawn_v6().await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        client
            .write_all(
                format!(
                    "CONNECT localhost:{} HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
                    backend.addr.port(),
                    http_auth()
                )
                .as_bytes(),
            )
            .await?;

        let response = read_head(&mut client).await?;
        assert!(response.starts_with("HTTP/1.0 200 "), "{response}");
        client.write_all(b"by name").await?;
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await
    .expect("timeout")
    .unwrap();

    assert_eq!(&echoed, b"by name");
    assert_eq!(backend.peer_ips(), vec![loopback()]);
}

#[tokio::test]
async fn connect_with_wrong_credentials_gets_407_without_dialing() {
    let backend = TcpEchoBackend::spawn_v6().await.unwrap();
    let proxy = ProxyHandle::spawn_v6().await.unwrap();

    let response = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        let wrong = egress6_proxy::Credentials::new(harness::HTTP_USER, "nope").basic_header();
        client
            .write_all(
                format!(
                    "CONNECT {} HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
                    backend.addr, wrong
                )
                .as_bytes(),
            )
            .await?;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&response).to_string())
    })
    .await
    .expect("timeout")
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 407 "));
    assert!(response.contains("Proxy-Authenticate: Basic realm=\"egress6\"\r\n"));
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(proxy.http.stats().auth_failed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn connect_to_unreachable_target_gets_500() {
    let proxy = ProxyHandle::spawn_v6().await.unwrap();
    let target = closed_port_v6().await;

    let response = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        client
            .write_all(
                format!(
                    "CONNECT {} HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
                    target,
                    http_auth()
                )
                .as_bytes(),
            )
            .await?;
        let mut response = Vec::new();
        client.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&response).to_string())
    })
    .await
    .expect("timeout")
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert_eq!(proxy.http.stats().dial_failed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn plain_request_is_forwarded_in_origin_form() {
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\n\r\nhello";
    let origin = HttpOriginBackend::spawn_v6(RESPONSE).await.unwrap();
    let proxy = ProxyHandle::spawn_v6().await.unwrap();

    let response = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        client
            .write_all(
                format!(
                    "POST http://{}/submit?q=1 HTTP/1.1\r\n\
                     Host: origin.test\r\n\
                     Proxy-Authorization: {}\r\n\
                     Proxy-Connection: keep-alive\r\n\
                     Content-Length: 4\r\n\
                     \r\n\
                     data",
                    origin.addr,
                    http_auth()
                )
                .as_bytes(),
            )
            .await?;
        let mut response = Vec::new();
        client.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    })
    .await
    .expect("timeout")
    .unwrap();

    // Upstream response is returned verbatim.
    assert_eq!(response, RESPONSE);

    let requests = origin.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.head.starts_with("POST /submit?q=1 HTTP/1.1\r\n"));
    // Host follows the request URI, not the client's Host header.
    assert!(request.head.contains(&format!("Host: {}\r\n", origin.addr)));
    assert!(!request.head.contains("origin.test"));
    assert!(request.head.contains("Connection: close\r\n"));
    assert!(!request.head.contains("Proxy-Authorization"));
    assert!(!request.head.contains("Proxy-Connection"));
    assert_eq!(request.body, b"data");
    assert_eq!(request.peer.ip(), loopback());
}

#[rstest]
#[case::awaiting_response("\r\n")]
#[case::short_body("Content-Length: 10\r\n\r\nabcd")]
#[tokio::test]
async fn client_leaving_a_forwarded_request_releases_both_sides(#[case] tail: &str) {
    let origin = StallingBackend::spawn_v6().await.unwrap();
    let proxy = ProxyHandle::spawn_v6().await.unwrap();
    let stats = proxy.http.stats();

    let mut client = TcpStream::connect(proxy.http_addr).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://{}/slow HTTP/1.1\r\nProxy-Authorization: {}\r\n{}",
                origin.addr,
                http_auth(),
                tail
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    timeout(TEST_TIMEOUT, wait_until(|| origin.connection_count() == 1))
        .await
        .expect("origin was never dialed");
    assert_eq!(stats.connections_active.load(Ordering::Relaxed), 1);

    drop(client);

    timeout(
        TEST_TIMEOUT,
        wait_until(|| {
            stats.connections_active.load(Ordering::Relaxed) == 0 && origin.closed_count() == 1
        }),
    )
    .await
    .expect("forwarded request outlived its client");
}

#[tokio::test]
async fn plain_request_to_unreachable_target_gets_502() {
    let proxy = ProxyHandle::spawn_v6().await.unwrap();
    let target = closed_port_v6().await;

    let response = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        client
            .write_all(
                format!(
                    "GET http://{}/ HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
                    target,
                    http_auth()
                )
                .as_bytes(),
            )
            .await?;
        read_head(&mut client).await
    })
    .await
    .expect("timeout")
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn plain_request_without_credentials_keeps_connection_open() {
    let proxy = ProxyHandle::spawn_v6().await.unwrap();

    let statuses = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy.http_addr).await?;
        let mut statuses = Vec::new();
        for _ in 0..2 {
            client
                .write_all(b"GET http://origin.test/ HTTP/1.1\r\nHost: origin.test\r\n\r\n")
                .await?;
            let head = read_head(&mut client).await?;
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            let mut body = vec![0u8; length];
            client.read_exact(&mut body).await?;
            statuses.push(head.lines().next().unwrap_or_default().to_string());
        }
        Ok::<_, std::io::Error>(statuses)
    })
    .await
    .expect("timeout")
    .unwrap();

    assert_eq!(
        statuses,
        vec![
            "HTTP/1.1 407 Proxy Authentication Required",
            "HTTP/1.1 407 Proxy Authentication Required"
        ]
    );
    assert_eq!(proxy.http.stats().auth_failed.load(Ordering::Relaxed), 2);
}
