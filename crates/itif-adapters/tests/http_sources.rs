use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use itif_adapters::{
    AdapterContext, FeedAdapter, FeedFlavour, FeedTarget, InternshalaAdapter, SourceAdapter, SourceConfig,
    SourceKind, INTERNSHALA_SEARCH_PATH,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_text(source: &str, file: &str) -> String {
    std::fs::read_to_string(workspace_root().join("fixtures").join(source).join(file)).expect("fixture")
}

type Route = dyn Fn(&str) -> (u16, String) + Send + Sync;

/// Minimal HTTP/1.1 responder; records each request path with its arrival time.
async fn serve(route: Arc<Route>) -> (String, Arc<Mutex<Vec<(String, Instant)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let hits = Arc::new(Mutex::new(Vec::new()));
    let log = hits.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let route = route.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
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
                let head = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                log.lock().unwrap().push((path.clone(), Instant::now()));

                let (status, body) = route(&path);
                let response = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), hits)
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
        budget: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn internshala_pages_are_spaced_once_and_stop_at_first_empty_page() {
    let page_one = fixture_text("internshala", "page-1.html");
    let empty = fixture_text("internshala", "empty.html");
    let (base, hits) = serve(Arc::new(move |path: &str| {
        if path == INTERNSHALA_SEARCH_PATH {
            (200, page_one.clone())
        } else {
            (200, empty.clone())
        }
    }))
    .await;

    let mut config = SourceConfig::new("internshala", "Internshala", SourceKind::Internshala);
    config.endpoint = Some(base.clone());
    config.max_pages = 3;
    let pause = Duration::from_millis(300);
    let mut adapter = InternshalaAdapter::new(config).with_page_pause(pause);

    let started = Instant::now();
    adapter.setup().await.expect("setup");
    let records = adapter.fetch(&ctx()).await.expect("fetch");
    let elapsed = started.elapsed();
    adapter.teardown().await;

    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0].identity().as_str(),
        format!("{base}/internship/detail/web-development-internship-123")
    );

    let hits = hits.lock().unwrap().clone();
    assert_eq!(
        hits.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
        vec![
            INTERNSHALA_SEARCH_PATH.to_string(),
            format!("{INTERNSHALA_SEARCH_PATH}/page-2"),
        ]
    );
    assert!(elapsed >= pause, "second page waited for the bucket: {elapsed:?}");
    assert!(
        elapsed < pause * 2,
        "pages are throttled once, not twice: {elapsed:?}"
    );
}

#[tokio::test]
async fn feed_source_with_one_empty_and_one_failing_feed_succeeds() {
    let empty_feed = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>quiet</title></channel></rss>"#;
    let (base, hits) = serve(Arc::new(move |path: &str| match path {
        "/quiet.rss" => (200, empty_feed.to_string()),
        _ => (503, "down".to_string()),
    }))
    .await;

    let mut config = SourceConfig::new("rss-feeds", "Job board feeds", SourceKind::Rss);
    config.max_retries = 0;
    config.feeds = vec![
        FeedTarget {
            label: "quiet".into(),
            url: format!("{base}/quiet.rss"),
        },
        FeedTarget {
            label: "down".into(),
            url: format!("{base}/down.rss"),
        },
    ];
    let mut adapter = FeedAdapter::new(config.clone(), FeedFlavour::Generic);
    adapter.setup().await.expect("setup");
    let records = adapter.fetch(&ctx()).await.expect("one healthy feed is enough");
    assert!(records.is_empty());
    assert_eq!(hits.lock().unwrap().len(), 2);

    config.feeds.remove(0);
    let mut all_down = FeedAdapter::new(config, FeedFlavour::Generic);
    all_down.setup().await.expect("setup");
    assert!(all_down.fetch(&ctx()).await.is_err());
}
