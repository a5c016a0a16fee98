mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use http::StatusCode;
use support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutable_suffix_revalidation() {
    let v1 = gen_bytes(48 * 1024);
    let v2 = gen_bytes(52 * 1024);
    let t1 = SystemTime::now() - Duration::from_secs(3600);

    // phase 0: first fill. phase 1: 304 not modified. phase 2: new content.
    let phase = Arc::new(AtomicUsize::new(0));
    let seen_ims: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let handler_phase = Arc::clone(&phase);
    let handler_ims = Arc::clone(&seen_ims);
    let (hv1, hv2) = (v1.clone(), v2.clone());
    let origin = MockServer::start(move |req| {
        if let Some(ims) = req
            .headers()
            .get("If-Modified-Since")
            .and_then(|val| val.to_str().ok())
        {
            handler_ims.lock().unwrap().push(ims.to_string());
        }
        match handler_phase.load(Ordering::SeqCst) {
            0 => resp_file(&hv1, t1),
            1 => resp_status(StatusCode::NOT_MODIFIED),
            _ => resp_file(&hv2, SystemTime::now()),
        }
    })
    .await;
    let mirror = start_mirror(&origin.url()).await;
    let client = TestClient::new();
    let url = mirror.repo_url("core.db");
    let cache_path = mirror.cache_path("core.db");

    // initial fill
    let resp = client.get(&url).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.cache_status(), "MISS");
    assert_eq!(hash_bytes(resp.body()), hash_bytes(&v1));
    assert!(
        wait_for(
            || std::fs::read(&cache_path)
                .map(|bytes| bytes == v1)
                .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen_ims.lock().unwrap().is_empty(), "cold miss is unconditional");

    // origin says 304: cached copy stays, response comes from cache
    phase.store(1, Ordering::SeqCst);
    let resp = client.get(&url).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.cache_status(), "REVALIDATE");
    assert_eq!(hash_bytes(resp.body()), hash_bytes(&v1));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(origin.hits(), 2);
    assert_eq!(std::fs::read(&cache_path).unwrap(), v1);
    // the revalidation carried the cached file's timestamp
    {
        let seen = seen_ims.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], httpdate::fmt_http_date(t1));
    }

    // origin has new content: this response still serves the old bytes, the
    // refresh lands in the background
    phase.store(2, Ordering::SeqCst);
    let resp = client.get(&url).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(hash_bytes(resp.body()), hash_bytes(&v1));
    assert!(
        wait_for(
            || std::fs::read(&cache_path)
                .map(|bytes| bytes == v2)
                .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await,
        "background refresh should replace the cached file"
    );
    assert_eq!(origin.hits(), 3);

    // and the next request sees the new content
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resp = client.get(&url).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(hash_bytes(resp.body()), hash_bytes(&v2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revalidation_never_blocks_the_response() {
    let v1 = gen_bytes(32 * 1024);
    let phase = Arc::new(AtomicUsize::new(0));
    let handler_phase = Arc::clone(&phase);
    let hv1 = v1.clone();
    let origin = MockServer::start(move |_req| {
        if handler_phase.load(Ordering::SeqCst) == 0 {
            resp_file(&hv1, SystemTime::now())
        } else {
            // a revalidation that takes its time
            let chunks = chunked(&hv1, 8 * 1024);
            resp_stream(hv1.len() as u64, chunks, Duration::from_millis(200), false)
        }
    })
    .await;
    let mirror = start_mirror(&origin.url()).await;
    let client = TestClient::new();
    let url = mirror.repo_url("extra.files");

    let resp = client.get(&url).await;
    assert_eq!(resp.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;

    phase.store(1, Ordering::SeqCst);
    let started = Instant::now();
    let resp = client.get(&url).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.cache_status(), "REVALIDATE");
    assert_eq!(hash_bytes(resp.body()), hash_bytes(&v1));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "cached serve must not wait for the refetch"
    );
}
