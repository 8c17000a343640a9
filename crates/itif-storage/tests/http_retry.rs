use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use itif_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answers request `n` (0-based) with `statuses[n]`, repeating the last one.
struct Upstream {
    base: String,
    requests: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
}

async fn upstream(statuses: Vec<u16>) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let requests = Arc::new(AtomicUsize::new(0));
    let heads = Arc::new(Mutex::new(Vec::new()));
    let (counter, log) = (requests.clone(), heads.clone());

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let status = statuses[index.min(statuses.len() - 1)];
            let log = log.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8 * 1024];
                let mut read = 0;
                while read < buf.len() {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                log.lock().unwrap().push(String::from_utf8_lossy(&buf[..read]).to_string());

                let body = format!("status {status}");
                let response = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    Upstream {
        base: format!("http://{addr}"),
        requests,
        heads,
    }
}

fn fetcher(max_retries: usize) -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        ..Default::default()
    })
    .expect("fetcher")
}

#[tokio::test]
async fn server_errors_are_retried_up_to_max_attempts() {
    let server = upstream(vec![503]).await;
    let err = fetcher(2)
        .fetch_bytes(&format!("{}/jobs", server.base))
        .await
        .expect_err("keeps failing");

    assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    assert_eq!(server.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limit_then_success_returns_the_body() {
    let server = upstream(vec![429, 502, 200]).await;
    let resp = fetcher(3)
        .fetch_bytes(&format!("{}/jobs", server.base))
        .await
        .expect("recovers");

    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(resp.text(), "status 200");
    assert_eq!(server.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_fail_without_retrying() {
    for status in [404u16, 403, 400] {
        let server = upstream(vec![status, 200]).await;
        let err = fetcher(3)
            .fetch_bytes(&format!("{}/gone", server.base))
            .await
            .expect_err("not retried into the 200");

        match err {
            FetchError::HttpStatus { status: got, url } => {
                assert_eq!(got, status);
                assert!(url.ends_with("/gone"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.requests.load(Ordering::SeqCst), 1, "status {status}");
    }
}

#[tokio::test]
async fn refused_connections_surface_as_request_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = fetcher(1)
        .fetch_bytes(&format!("http://{addr}/jobs"))
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, FetchError::Request(_)));
}

#[tokio::test]
async fn query_and_bearer_token_are_sent() {
    let server = upstream(vec![200]).await;
    fetcher(0)
        .get(
            &format!("{}/documents/internships", server.base),
            &[("pageSize", "3".to_string())],
            Some("secret-token"),
        )
        .await
        .expect("ok");

    let heads = server.heads.lock().unwrap().clone();
    assert!(heads[0].starts_with("GET /documents/internships?pageSize=3 "));
    assert!(heads[0].to_ascii_lowercase().contains("authorization: bearer secret-token"));
}

#[tokio::test]
async fn token_bucket_spaces_requests() {
    let server = upstream(vec![200]).await;
    let refill = Duration::from_millis(250);
    let started = Instant::now();
    let fetcher = HttpFetcher::new(HttpClientConfig {
        token_bucket: Some(TokenBucketConfig {
            capacity: 1,
            refill_every: refill,
        }),
        ..Default::default()
    })
    .expect("fetcher");

    for _ in 0..2 {
        fetcher.fetch_bytes(&format!("{}/page", server.base)).await.expect("ok");
    }
    assert!(started.elapsed() >= refill);
    assert_eq!(server.requests.load(Ordering::SeqCst), 2);
}
