// End-to-end: HTTP front door -> proxy service -> HTTP engine client -> mock engine

use std::sync::Arc;
use std::time::Duration;

use aceproxy_livestream::{
    create_proxy_router, HttpEngineClient, HttpProxyState, ProxyService, StreamSettings,
};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_engine(server: &MockServer, payload: &'static [u8], session_delay: Duration) {
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/ace/getstream"))
        .and(query_param("format", "json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "response": {
                        "playback_url": format!("{base}/content/abc/0.ts"),
                        "stat_url": format!("{base}/ace/stat/abc"),
                        "command_url": format!("{base}/ace/cmd/abc"),
                    },
                    "error": null
                }))
                .set_delay(session_delay),
        )
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/content/abc/0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ace/cmd/abc"))
        .and(query_param("method", "stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "ok", "error": null })))
        .mount(server)
        .await;
}

fn app(server: &MockServer) -> (Router, Arc<ProxyService>) {
    let engine = HttpEngineClient::with_base_url(server.uri(), Duration::from_secs(5), 8192)
        .expect("engine client");
    let service = Arc::new(ProxyService::new(Arc::new(engine), StreamSettings::default()));
    (create_proxy_router(HttpProxyState::new(service.clone())), service)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn wait_for_stop(server: &MockServer) -> usize {
    for _ in 0..50 {
        let stops = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/ace/cmd/abc")
            .count();
        if stops > 0 {
            return stops;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    0
}

#[tokio::test]
async fn test_viewer_receives_engine_bytes() {
    let server = MockServer::start().await;
    mount_engine(&server, b"\x47mpegts-payload", Duration::ZERO).await;
    let (app, service) = app(&server);

    let response = app.oneshot(get("/ace/getstream?id=abc")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/MP2T");

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"\x47mpegts-payload");

    assert_eq!(wait_for_stop(&server).await, 1);
    assert_eq!(service.active_stream_count(), 0);
}

#[tokio::test]
async fn test_concurrent_viewers_share_one_session() {
    let server = MockServer::start().await;
    mount_engine(&server, b"shared-bytes", Duration::from_millis(200)).await;
    let (app, _service) = app(&server);

    let (a, b) = tokio::join!(
        app.clone().oneshot(get("/ace/getstream?id=abc&username=a")),
        app.clone().oneshot(get("/ace/getstream?id=abc&username=b")),
    );
    for response in [a.unwrap(), b.unwrap()] {
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"shared-bytes");
    }

    assert_eq!(wait_for_stop(&server).await, 1);
    // `expect(1)` on getstream and playback is verified when the server drops
}

#[tokio::test]
async fn test_engine_error_is_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ace/getstream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "response": null, "error": "no peers" })),
        )
        .mount(&server)
        .await;
    let (app, service) = app(&server);

    let response = app.oneshot(get("/ace/getstream?infohash=abc")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(service.active_stream_count(), 0);
}

#[tokio::test]
async fn test_unreachable_engine_is_service_unavailable() {
    let engine = HttpEngineClient::with_base_url("http://127.0.0.1:9", Duration::from_secs(2), 8192)
        .expect("engine client");
    let service = Arc::new(ProxyService::new(Arc::new(engine), StreamSettings::default()));
    let app = create_proxy_router(HttpProxyState::new(service));

    let response = app.oneshot(get("/ace/getstream?id=abc")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
