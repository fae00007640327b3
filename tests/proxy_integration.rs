//! goproxy.cn Integration Tests
//!
//! Runs the whole component graph: front door, redirect policy, upstream
//! engine, staging, coalesced uploads and object stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use goproxy_cn::adapters::{InMemoryObjectStore, S3Config, S3ObjectStore, StoreOp};
use goproxy_cn::handler::RedirectConfig;

const ZIP: &str = "example.com/mod/@v/v1.2.3.zip";

// =============================================================================
// Redirects
// =============================================================================

mod redirect_tests {
    use super::*;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_large_durable_artifact_redirects_to_signed_url() {
        let s3 = stub(vec![(
            "/goproxy/example.com/mod/@v/v1.2.3.zip",
            "HTTP/1.1 200 OK\r\nContent-Length: 50000000\r\nContent-Type: application/zip\r\nLast-Modified: Wed, 21 Oct 2015 07:28:00 GMT\r\nConnection: close\r\n\r\n"
                .to_string(),
        )])
        .await;
        let store = Arc::new(
            S3ObjectStore::new(S3Config {
                endpoint: s3.url.clone(),
                access_key: "AKIDEXAMPLE".into(),
                secret_key: "secret".into(),
                ..S3Config::default()
            })
            .unwrap(),
        );
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(
            store,
            dir.path(),
            "http://127.0.0.1:9",
            RedirectConfig {
                min_size: 10_000_000,
                ..RedirectConfig::default()
            },
        );
        let (addr, shutdown) = listen(m.server.clone()).await;

        let response = client()
            .get(format!("http://{}/{}", addr, ZIP))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["cache-control"], "no-store");
        let location = response.headers()["location"].to_str().unwrap().to_string();
        assert!(location.starts_with(&s3.url));
        assert!(location.contains("mod/@v/v1.2.3.zip"));
        assert!(location.contains("X-Amz-Signature="));
        assert!(location.contains("X-Amz-Expires=86400"));

        let requests = s3.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("HEAD /goproxy/example.com/mod/@v/v1.2.3.zip?"));
        assert_eq!(m.metrics.decision_count("redirect"), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_small_durable_artifact_streams_from_storage() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put_bytes(ZIP, "application/zip", "tiny zip");
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(
            store.clone(),
            dir.path(),
            "http://127.0.0.1:9",
            RedirectConfig::default(),
        );
        let (addr, shutdown) = listen(m.server.clone()).await;

        let response = client()
            .get(format!("http://{}/{}", addr, ZIP))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], "max-age=31536000");
        assert_eq!(response.text().await.unwrap(), "tiny zip");
        assert_eq!(store.stats().presigns, 0);
        assert_eq!(m.metrics.decision_count("below_threshold"), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_redirect_disabled_serves_via_engine() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put_bytes(ZIP, "application/zip", "0123456789");
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(
            store.clone(),
            dir.path(),
            "http://127.0.0.1:9",
            RedirectConfig {
                auto_redirect: false,
                min_size: 1,
                ..RedirectConfig::default()
            },
        );
        let (addr, shutdown) = listen(m.server.clone()).await;

        let response = client()
            .get(format!("http://{}/{}", addr, ZIP))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.stats().presigns, 0);
        assert_eq!(m.metrics.decision_count("disabled"), 1);

        shutdown.cancel();
    }
}

// =============================================================================
// Miss Population
// =============================================================================

mod population_tests {
    use super::*;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_miss_falls_through_and_is_promoted() {
        let upstream = stub(vec![("/example.com/mod/@v/v1.2.3.zip", ok("application/zip", "zip bytes"))]).await;
        let store = Arc::new(InMemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store.clone(), dir.path(), &upstream.url, RedirectConfig::default());
        let (addr, shutdown) = listen(m.server.clone()).await;
        m.coalescer.start();

        let response = client()
            .get(format!("http://{}/{}", addr, ZIP))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "zip bytes");
        assert_eq!(m.metrics.decision_count("miss"), 1);

        assert!(eventually(|| store.contains(ZIP)).await);
        assert_eq!(&store.get_bytes(ZIP).unwrap()[..], b"zip bytes");
        assert!(eventually(|| !m.coalescer.is_tracked(ZIP)).await);
        assert!(!m.staging.path_for(ZIP).exists());

        shutdown.cancel();
        m.coalescer.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_writers_upload_once() {
        use goproxy_cn::domain::{Artifact, Cacher};
        use tokio_util::sync::CancellationToken;

        let store = Arc::new(InMemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store.clone(), dir.path(), "http://127.0.0.1:9", RedirectConfig::default());
        let cx = CancellationToken::new();

        let writers = (0..8).map(|i| {
            let cacher = m.cacher.clone();
            let cx = cx.clone();
            async move {
                cacher
                    .set_cache(
                        &cx,
                        Artifact::new(ZIP),
                        Box::new(std::io::Cursor::new(format!("content {}", i).into_bytes())),
                    )
                    .await
            }
        });
        for result in futures::future::join_all(writers).await {
            assert!(result.is_ok());
        }

        m.coalescer.start();
        assert!(eventually(|| store.contains(ZIP)).await);
        assert!(eventually(|| !m.coalescer.is_tracked(ZIP)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.stats().puts, 1);
        assert_eq!(m.metrics.upload_count("uploaded"), 1);

        m.coalescer.stop().await;
    }

    #[tokio::test]
    async fn test_upstream_missing_module_is_404() {
        let upstream = stub(vec![]).await;
        let store = Arc::new(InMemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store.clone(), dir.path(), &upstream.url, RedirectConfig::default());
        let (addr, shutdown) = listen(m.server.clone()).await;

        let response = client()
            .get(format!("http://{}/{}", addr, ZIP))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!m.coalescer.is_tracked(ZIP));

        shutdown.cancel();
    }
}

// =============================================================================
// Front Door
// =============================================================================

mod front_door_tests {
    use super::*;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_traversal_is_cached_404_without_storage_access() {
        let store = Arc::new(InMemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store.clone(), dir.path(), "http://127.0.0.1:9", RedirectConfig::default());
        let (addr, shutdown) = listen(m.server.clone()).await;

        for path in ["/example.com/..%2f..%2fetc/passwd", "/example.com/mod/@v/v1.2.3.zip/"] {
            let response = client()
                .get(format!("http://{}{}", addr, path))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", path);
            assert_eq!(response.headers()["cache-control"], "public, max-age=86400");
        }
        assert_eq!(store.stats().stats, 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_head_and_method_handling() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put_bytes(ZIP, "application/zip", "tiny zip");
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store, dir.path(), "http://127.0.0.1:9", RedirectConfig::default());
        let (addr, shutdown) = listen(m.server.clone()).await;
        let url = format!("http://{}/{}", addr, ZIP);

        let head = client().head(&url).send().await.unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert!(head.bytes().await.unwrap().is_empty());

        let post = client().post(&url).send().await.unwrap();
        assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(post.headers()["allow"], "GET, HEAD");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_storage_outage_retries_then_502() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_always(StoreOp::Stat, 503);
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store.clone(), dir.path(), "http://127.0.0.1:9", RedirectConfig::default());

        let response = m
            .server
            .handle(
                hyper::Request::builder()
                    .uri(format!("/{}", ZIP))
                    .body(())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
        assert_eq!(store.stats().stats, fast_retry().max_attempts as u64);
    }
}

// =============================================================================
// Shutdown
// =============================================================================

mod shutdown_tests {
    use super::*;
    use goproxy_cn::domain::{Artifact, Cacher};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_stop_promotes_pending_then_cleanup_removes_scratch_root() {
        let store = Arc::new(InMemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store.clone(), dir.path(), "http://127.0.0.1:9", RedirectConfig::default());
        let cx = CancellationToken::new();

        m.cacher
            .set_cache(
                &cx,
                Artifact::new("example.com/mod/@v/v1.2.3.mod"),
                Box::new(std::io::Cursor::new(b"module example.com/mod".to_vec())),
            )
            .await
            .unwrap();
        let root = m.staging.root().to_path_buf();
        assert!(root.exists());

        m.coalescer.stop().await;
        assert!(store.contains("example.com/mod/@v/v1.2.3.mod"));
        assert!(m.staging.cleanup().await);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_artifact_served_while_draining_is_promoted() {
        let upstream = stub(vec![("/example.com/mod/@v/v1.2.3.zip", ok("application/zip", "late zip"))]).await;
        let store = Arc::new(InMemoryObjectStore::new());
        let dir = tempfile::tempdir().unwrap();
        let m = mirror(store.clone(), dir.path(), &upstream.url, RedirectConfig::default());
        m.coalescer.start();

        // The front door stops accepting before this in-flight request finishes.
        let (_addr, shutdown) = listen(m.server.clone()).await;
        shutdown.cancel();

        let response = m
            .server
            .handle(
                hyper::Request::builder()
                    .uri(format!("/{}", ZIP))
                    .body(())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), hyper::StatusCode::OK);

        m.coalescer.stop().await;
        assert_eq!(&store.get_bytes(ZIP).unwrap()[..], b"late zip");
        assert!(m.staging.cleanup().await);
    }
}
